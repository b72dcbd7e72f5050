use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use super::{StatusStore, StoreError};
use crate::models::{StatusPatch, StatusRecord, Versioned};

type Interleave = Box<dyn FnOnce(&mut StatusRecord) + Send>;

#[derive(Default)]
struct MemoryInner {
    record: Option<StatusRecord>,
    version: u64,
    subscribers: Vec<UnboundedSender<StatusRecord>>,
    failing_writes: u32,
    after_next_read: Option<Interleave>,
}

impl MemoryInner {
    fn commit(&mut self, record: StatusRecord) {
        self.record = Some(record.clone());
        self.version += 1;
        self.subscribers
            .retain(|subscriber| subscriber.send(record.clone()).is_ok());
    }

    fn check_write(&mut self) -> Result<(), StoreError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StoreError::Rejected("injected write failure".into()));
        }
        Ok(())
    }
}

/// In-process store with the same merge and versioning rules as the remote
/// one. Used for `--dry-run` and by the tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: StatusRecord) -> Self {
        let store = Self::new();
        store.lock().commit(record);
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn snapshot(&self) -> Option<StatusRecord> {
        self.lock().record.clone()
    }

    /// Number of committed writes so far.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// A write from "another client", e.g. the app resetting `completed`.
    pub fn external_update(&self, patch: &StatusPatch) {
        let mut inner = self.lock();
        let mut record = inner.record.clone().unwrap_or_default();
        patch.apply_to(&mut record);
        inner.commit(record);
    }

    /// The next `count` writes fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    /// Runs `change` as a concurrent write right after the next versioned read.
    pub fn interleave_after_next_read(&self, change: impl FnOnce(&mut StatusRecord) + Send + 'static) {
        self.lock().after_next_read = Some(Box::new(change));
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn read(&self) -> Result<Option<StatusRecord>, StoreError> {
        Ok(self.snapshot())
    }

    async fn update(&self, patch: &StatusPatch) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check_write()?;
        let mut record = inner.record.clone().unwrap_or_default();
        patch.apply_to(&mut record);
        inner.commit(record);
        Ok(())
    }

    async fn set(&self, record: &StatusRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check_write()?;
        inner.commit(record.clone());
        Ok(())
    }

    async fn read_versioned(&self) -> Result<Versioned, StoreError> {
        let (versioned, interleave) = {
            let mut inner = self.lock();
            let versioned = Versioned {
                record: inner.record.clone(),
                version: inner.version.to_string(),
            };
            (versioned, inner.after_next_read.take())
        };

        // The hook may arm the next one, so it runs without the lock held.
        if let Some(change) = interleave {
            let mut record = versioned.record.clone().unwrap_or_default();
            change(&mut record);
            self.lock().commit(record);
        }

        Ok(versioned)
    }

    async fn replace_if_unchanged(
        &self,
        record: &StatusRecord,
        version: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.check_write()?;
        if inner.version.to_string() != version {
            return Ok(false);
        }
        inner.commit(record.clone());
        Ok(true)
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<UnboundedReceiver<StatusRecord>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.lock();
            if let Some(record) = inner.record.clone() {
                let _ = tx.send(record);
            }
            inner.subscribers.push(tx.clone());
        }

        // The receiver sees the end once both this task's sender and the
        // registered one are gone.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            cancel.cancelled().await;
            let mut guard = match inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard
                .subscribers
                .retain(|subscriber| !subscriber.same_channel(&tx));
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_merges_into_missing_node() {
        let store = MemoryStore::new();
        store
            .update(&StatusPatch {
                current_step: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        let record = store.read().await.unwrap().unwrap();
        assert_eq!(record.current_step, 2);
        assert!(!record.is_blending);
        assert_eq!(store.version(), 1);
    }

    #[tokio::test]
    async fn stale_version_is_refused() {
        let store = MemoryStore::with_record(StatusRecord::run_start(1));
        let versioned = store.read_versioned().await.unwrap();
        store.external_update(&StatusPatch {
            completed: Some(false),
            ..Default::default()
        });

        let mut record = versioned.record.unwrap();
        record.current_step = 5;
        assert!(!store
            .replace_if_unchanged(&record, &versioned.version)
            .await
            .unwrap());
        assert_eq!(store.snapshot().unwrap().current_step, 0);
    }

    #[tokio::test]
    async fn subscribers_see_current_value_then_changes() {
        let store = MemoryStore::with_record(StatusRecord::default());
        let cancel = CancellationToken::new();
        let mut rx = store.subscribe(cancel.clone()).await.unwrap();

        assert_eq!(rx.recv().await, Some(StatusRecord::default()));
        store.external_update(&StatusPatch {
            is_blending: Some(true),
            ..Default::default()
        });
        assert!(rx.recv().await.unwrap().is_blending);

        cancel.cancel();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store.set(&StatusRecord::default()).await.is_err());
        assert!(store.set(&StatusRecord::default()).await.is_ok());
    }
}
