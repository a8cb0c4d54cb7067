//! Boundary to the authoritative remote document store.
//!
//! Implementations wrap the network API and classify every failure into a
//! [`RemoteErrorKind`] before it reaches the sync engine.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::RemoteError;

/// Hard ceiling on writes per atomic batch imposed by the remote store.
pub const MAX_REMOTE_BATCH_SIZE: usize = 200;

/// Field stamped onto every payload written by this engine.
pub const LAST_SYNCED_AT_FIELD: &str = "lastSyncedAt";

/// One set-with-merge write against `collection/doc_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWrite {
    pub collection: String,
    pub doc_id: String,
    pub payload: Value,
}

/// User-implemented adapter over the remote store.
#[async_trait]
pub trait RemoteStoreAdapter: Send + Sync {
    /// Apply every write atomically: all succeed or none do.
    async fn commit_batch(&self, writes: &[RemoteWrite]) -> Result<(), RemoteError>;

    /// Single set-with-merge write. Used only by the optimistic direct-write
    /// path; queued replay always goes through `commit_batch`.
    async fn set_merge(&self, write: &RemoteWrite) -> Result<(), RemoteError>;
}

/// Copy of `payload` carrying `lastSyncedAt`. Non-object payloads are wrapped
/// as `{ "value": payload }` first.
pub fn tag_last_synced(payload: &Value, synced_at: i64) -> Value {
    let mut object = match payload {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    object.insert(LAST_SYNCED_AT_FIELD.to_string(), Value::from(synced_at));
    Value::Object(object)
}
