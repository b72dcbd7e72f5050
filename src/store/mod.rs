//! Client side of the shared status record.
//!
//! The store itself is external; this module only speaks to it.

pub mod firebase;
pub mod memory;
pub mod sse;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::models::{StatusPatch, StatusRecord, Versioned};

pub use firebase::FirebaseStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("change stream: {0}")]
    Stream(String),

    #[error("{0}")]
    Rejected(String),
}

/// The operations the bridge needs from the remote store.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// One-shot read; `None` when the node holds nothing.
    async fn read(&self) -> Result<Option<StatusRecord>, StoreError>;

    /// Field-level merge.
    async fn update(&self, patch: &StatusPatch) -> Result<(), StoreError>;

    /// Full replacement of the node.
    async fn set(&self, record: &StatusRecord) -> Result<(), StoreError>;

    async fn read_versioned(&self) -> Result<Versioned, StoreError>;

    /// Writes `record` only if the node still carries `version`.
    /// Returns `false` when someone else wrote in between.
    async fn replace_if_unchanged(
        &self,
        record: &StatusRecord,
        version: &str,
    ) -> Result<bool, StoreError>;

    /// Full snapshots, starting with the current value. Ends when `cancel`
    /// fires or the stream cannot be re-established.
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<UnboundedReceiver<StatusRecord>, StoreError>;
}
