//! Optimistic write path for field-worker mutations.
//!
//! A mutation is written to the local store first and returned to the caller
//! at once. The remote write runs on a spawned task bounded by a timeout; if
//! it fails, times out, or the device is offline, the payload goes to the
//! pending-write queue for replay.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

use crate::{
    error::Result,
    normalize::{normalize, RawIdentifier},
    queue::PendingWriteQueue,
    remote::{tag_last_synced, RemoteStoreAdapter, RemoteWrite},
    storage::{LocalStore, StorageBackend},
    sync::Connectivity,
    types::{
        DynamicOverlay, EntityId, EntryId, SurveyOverlay, TimestampedValue, DYNAMIC_COLLECTION,
        SURVEYS_COLLECTION,
    },
};

/// Bound on a single direct remote write.
pub const DEFAULT_DIRECT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How a mutation reached (or will reach) the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The direct write was acknowledged.
    Direct,
    /// The payload was queued for replay.
    Queued(EntryId),
    /// The incoming write was older than the stored value and was dropped.
    Skipped,
    /// Neither the remote nor the queue accepted the write. The local store
    /// still holds it.
    Failed(String),
}

/// Handle on a mutation's background delivery. Dropping it does not cancel
/// the delivery.
#[derive(Debug)]
pub struct WriteHandle {
    entity_id: EntityId,
    task: Option<JoinHandle<Delivery>>,
}

impl WriteHandle {
    fn skipped(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            task: None,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Whether the local write was applied.
    pub fn applied(&self) -> bool {
        self.task.is_some()
    }

    /// Wait for the delivery to settle.
    pub async fn delivery(self) -> Delivery {
        match self.task {
            None => Delivery::Skipped,
            Some(task) => task
                .await
                .unwrap_or_else(|e| Delivery::Failed(format!("delivery task failed: {e}"))),
        }
    }
}

/// Configuration for `OptimisticWriter`.
#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Direct remote write timeout (`None` = 5 s)
    pub direct_write_timeout: Option<Duration>,
}

// ============================================================================
// OptimisticWriter
// ============================================================================

pub struct OptimisticWriter<B: StorageBackend + 'static> {
    store: Arc<LocalStore<B>>,
    queue: PendingWriteQueue<B>,
    remote: Arc<dyn RemoteStoreAdapter>,
    connectivity: Connectivity,
    direct_write_timeout: Duration,
    /// Held across each overlay read-modify-write so concurrent patches of
    /// one entity cannot drop each other's fields.
    overlay_lock: Mutex<()>,
}

impl<B: StorageBackend + 'static> OptimisticWriter<B> {
    pub fn new(
        store: Arc<LocalStore<B>>,
        queue: PendingWriteQueue<B>,
        remote: Arc<dyn RemoteStoreAdapter>,
        connectivity: Connectivity,
        options: WriterOptions,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            connectivity,
            direct_write_timeout: options
                .direct_write_timeout
                .unwrap_or(DEFAULT_DIRECT_WRITE_TIMEOUT),
            overlay_lock: Mutex::new(()),
        }
    }

    /// Set one dynamic field.
    ///
    /// If the stored field carries a newer timestamp the write is dropped and
    /// the handle resolves to `Delivery::Skipped`. Must be called inside a
    /// Tokio runtime.
    pub fn set_dynamic_field(
        &self,
        raw_id: impl Into<RawIdentifier>,
        field: &str,
        value: Value,
        updated_at: i64,
    ) -> Result<WriteHandle> {
        let id = normalize(raw_id);
        let incoming = TimestampedValue::new(value, updated_at);
        let mut cells = Map::new();
        cells.insert(
            field.to_string(),
            json!({ "value": incoming.value.clone(), "updatedAt": updated_at }),
        );

        {
            let _guard = self.overlay_lock.lock();
            let mut overlay = self
                .store
                .get_dynamic(&id)?
                .unwrap_or_else(|| DynamicOverlay::new(id.clone()));
            if let Some(current) = overlay.fields.get(field) {
                if !incoming.supersedes(current) {
                    tracing::debug!(
                        entity_id = %id,
                        field,
                        incoming = updated_at,
                        current = ?current.updated_at,
                        "stale dynamic write dropped"
                    );
                    return Ok(WriteHandle::skipped(id));
                }
            }
            overlay.fields.insert(field.to_string(), incoming);
            self.store.put(overlay)?;
        }

        let payload = json!({ "fields": cells });
        Ok(self.dispatch(id, DYNAMIC_COLLECTION, payload))
    }

    /// Replace the survey overlay with `fields`.
    ///
    /// A save older than the stored overlay is dropped. Must be called inside
    /// a Tokio runtime.
    pub fn save_survey(
        &self,
        raw_id: impl Into<RawIdentifier>,
        fields: Map<String, Value>,
        updated_at: i64,
    ) -> Result<WriteHandle> {
        let id = normalize(raw_id);
        let overlay = SurveyOverlay {
            entity_id: id.clone(),
            fields,
            updated_at: Some(updated_at),
        };
        let payload = serde_json::to_value(&overlay)
            .map_err(|e| crate::error::CanvassError::Internal(format!("serialize survey: {e}")))?;

        {
            let _guard = self.overlay_lock.lock();
            if let Some(current) = self.store.get_survey(&id)? {
                if current.updated_at.is_some_and(|at| at > updated_at) {
                    tracing::debug!(entity_id = %id, incoming = updated_at, "stale survey save dropped");
                    return Ok(WriteHandle::skipped(id));
                }
            }
            self.store.put(overlay)?;
        }

        Ok(self.dispatch(id, SURVEYS_COLLECTION, payload))
    }

    fn dispatch(&self, id: EntityId, collection: &'static str, payload: Value) -> WriteHandle {
        let write = RemoteWrite {
            collection: collection.to_string(),
            doc_id: id.as_str().to_string(),
            payload,
        };
        let task = tokio::spawn(deliver(
            Arc::clone(&self.remote),
            self.queue.clone(),
            self.connectivity.clone(),
            self.direct_write_timeout,
            id.clone(),
            write,
        ));
        WriteHandle {
            entity_id: id,
            task: Some(task),
        }
    }
}

async fn deliver<B: StorageBackend + 'static>(
    remote: Arc<dyn RemoteStoreAdapter>,
    queue: PendingWriteQueue<B>,
    connectivity: Connectivity,
    timeout: Duration,
    entity_id: EntityId,
    write: RemoteWrite,
) -> Delivery {
    if connectivity.is_online() {
        let direct = RemoteWrite {
            collection: write.collection.clone(),
            doc_id: write.doc_id.clone(),
            payload: tag_last_synced(&write.payload, chrono::Utc::now().timestamp_millis()),
        };
        match tokio::time::timeout(timeout, remote.set_merge(&direct)).await {
            Ok(Ok(())) => return Delivery::Direct,
            Ok(Err(e)) => tracing::debug!(
                collection = %write.collection,
                entity_id = %entity_id,
                error = %e,
                "direct write failed; queueing"
            ),
            Err(_) => tracing::debug!(
                collection = %write.collection,
                entity_id = %entity_id,
                timeout_ms = timeout.as_millis() as u64,
                "direct write timed out; queueing"
            ),
        }
    }

    match queue.enqueue(&write.collection, &entity_id, write.payload) {
        Ok(local_id) => Delivery::Queued(local_id),
        Err(e) => {
            tracing::warn!(
                collection = %write.collection,
                entity_id = %entity_id,
                error = %e,
                "could not queue write; it exists only locally"
            );
            Delivery::Failed(e.to_string())
        }
    }
}
