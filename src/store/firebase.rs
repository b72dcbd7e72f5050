//! Firebase Realtime Database over its REST interface.
//!
//! Reads and writes are plain `GET`/`PUT`/`PATCH` on `<db>/<path>.json`.
//! Change notifications come from the same URL as a server-sent-event stream
//! of `put`/`patch` deltas, folded into a local mirror of the node.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{
    header::{ACCEPT, ETAG, IF_MATCH},
    Client, Response, StatusCode,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use super::sse::{SseDecoder, SseEvent};
use super::{StatusStore, StoreError};
use crate::dispatch::RetryPolicy;
use crate::models::{StatusPatch, StatusRecord, Versioned};
use crate::settings::RemoteCredentials;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const REQUEST_TIMEOUT_SECS: u64 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const ETAG_REQUEST_HEADER: &str = "X-Firebase-ETag";

#[derive(Clone)]
pub struct FirebaseStore {
    client: Client,
    stream_client: Client,
    node_url: String,
    auth_token: String,
    stream_retry: RetryPolicy,
}

impl FirebaseStore {
    pub fn new(credentials: &RemoteCredentials, stream_retry: RetryPolicy) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        // The change stream stays open indefinitely, so no overall timeout.
        let stream_client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            stream_client,
            node_url: node_url(credentials),
            auth_token: credentials.auth_token.clone(),
            stream_retry,
        })
    }

    pub fn node_url(&self) -> &str {
        &self.node_url
    }

    fn auth(&self) -> [(&'static str, &str); 1] {
        [("auth", self.auth_token.as_str())]
    }
}

fn node_url(credentials: &RemoteCredentials) -> String {
    format!("{}/{}.json", credentials.database_url, credentials.status_path)
}

async fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

fn record_from(value: Value) -> Result<Option<StatusRecord>, StoreError> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

#[async_trait]
impl StatusStore for FirebaseStore {
    async fn read(&self) -> Result<Option<StatusRecord>, StoreError> {
        let response = self.client.get(&self.node_url).query(&self.auth()).send().await?;
        let value: Value = check_status(response).await?.json().await?;
        record_from(value)
    }

    async fn update(&self, patch: &StatusPatch) -> Result<(), StoreError> {
        let response = self
            .client
            .patch(&self.node_url)
            .query(&self.auth())
            .json(patch)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn set(&self, record: &StatusRecord) -> Result<(), StoreError> {
        let response = self
            .client
            .put(&self.node_url)
            .query(&self.auth())
            .json(record)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn read_versioned(&self) -> Result<Versioned, StoreError> {
        let response = self
            .client
            .get(&self.node_url)
            .query(&self.auth())
            .header(ETAG_REQUEST_HEADER, "true")
            .send()
            .await?;
        let response = check_status(response).await?;

        let version = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StoreError::Rejected("response carried no ETag".into()))?;
        let value: Value = response.json().await?;

        Ok(Versioned {
            record: record_from(value)?,
            version,
        })
    }

    async fn replace_if_unchanged(
        &self,
        record: &StatusRecord,
        version: &str,
    ) -> Result<bool, StoreError> {
        let response = self
            .client
            .put(&self.node_url)
            .query(&self.auth())
            .header(IF_MATCH, version)
            .json(record)
            .send()
            .await?;

        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Ok(false);
        }
        check_status(response).await?;
        Ok(true)
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<UnboundedReceiver<StatusRecord>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        tokio::spawn(async move { store.stream_changes(tx, cancel).await });
        Ok(rx)
    }
}

impl FirebaseStore {
    /// Keeps one change stream open, re-opening it with backoff when it drops.
    async fn stream_changes(self, tx: UnboundedSender<StatusRecord>, cancel: CancellationToken) {
        let mut attempt = 0u32;

        loop {
            let mut delivered = false;
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.follow_stream(&tx, &mut delivered) => result,
            };

            if tx.is_closed() {
                return;
            }
            if let Err(err) = result {
                log_warn!("Change stream for {} ended: {}", self.node_url, err);
            }
            if delivered {
                attempt = 0;
            }

            attempt += 1;
            let Some(delay) = self.stream_retry.jittered(attempt) else {
                log_error!(
                    "Giving up on change stream after {} attempts; restart the bridge",
                    attempt - 1
                );
                return;
            };
            log_info!("Re-opening change stream in {:?} (attempt {})", delay, attempt);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Follows one stream until it ends. Returns `Ok` only when the receiver
    /// went away; `delivered` records whether any snapshot got through.
    async fn follow_stream(
        &self,
        tx: &UnboundedSender<StatusRecord>,
        delivered: &mut bool,
    ) -> Result<(), StoreError> {
        let response = self
            .stream_client
            .get(&self.node_url)
            .query(&self.auth())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = check_status(response).await?;
        log_info!("Listening for changes on {}", self.node_url);

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut mirror = JsonMirror::default();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for event in decoder.push(&chunk) {
                match mirror.apply(&event) {
                    Ok(MirrorUpdate::Snapshot(record)) => {
                        if tx.send(record).is_err() {
                            return Ok(());
                        }
                        *delivered = true;
                    }
                    Ok(MirrorUpdate::Empty) => log_info!("Status node is empty"),
                    Ok(MirrorUpdate::Ignored) => {}
                    Err(StoreError::Decode(err)) => {
                        log_warn!("Skipping malformed {} event: {}", event.event, err);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Err(StoreError::Stream("server closed the stream".into()))
    }
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    path: String,
    data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MirrorUpdate {
    Snapshot(StatusRecord),
    /// The node was deleted or never written.
    Empty,
    Ignored,
}

/// Local copy of the watched node, rebuilt from stream deltas.
#[derive(Debug, Default)]
pub struct JsonMirror {
    root: Value,
}

impl JsonMirror {
    pub fn apply(&mut self, event: &SseEvent) -> Result<MirrorUpdate, StoreError> {
        match event.event.as_str() {
            "put" => {
                let delta: StreamDelta = serde_json::from_str(&event.data)?;
                put_at(&mut self.root, &delta.path, delta.data);
            }
            "patch" => {
                let delta: StreamDelta = serde_json::from_str(&event.data)?;
                let Value::Object(fields) = delta.data else {
                    return Err(StoreError::Stream(format!(
                        "patch at {} did not carry an object",
                        delta.path
                    )));
                };
                for (key, value) in fields {
                    put_at(&mut self.root, &format!("{}/{}", delta.path, key), value);
                }
            }
            "keep-alive" => return Ok(MirrorUpdate::Ignored),
            "cancel" => {
                return Err(StoreError::Stream(
                    "server cancelled the stream (security rules)".into(),
                ))
            }
            "auth_revoked" => {
                return Err(StoreError::Stream("auth token expired or was revoked".into()))
            }
            other => {
                log_debug!("Ignoring unknown stream event {}", other);
                return Ok(MirrorUpdate::Ignored);
            }
        }

        if is_empty(&self.root) {
            return Ok(MirrorUpdate::Empty);
        }
        let record = serde_json::from_value(self.root.clone())?;
        Ok(MirrorUpdate::Snapshot(record))
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

/// Writes `data` at `path`, creating objects on the way. `null` deletes.
fn put_at(root: &mut Value, path: &str, data: Value) {
    let segments = segments(path);
    let Some((last, parents)) = segments.split_last() else {
        *root = data;
        return;
    };

    if data.is_null() {
        let parent = parents
            .iter()
            .try_fold(&mut *root, |node, segment| node.get_mut(*segment));
        if let Some(Value::Object(map)) = parent {
            map.remove(*last);
        }
        return;
    }

    let mut node = root;
    for segment in parents.iter().chain(std::iter::once(last)) {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    *node = data;
}
