//! PendingWriteQueue: durable log of writes the remote has not acknowledged.
//!
//! Entries live in the same backend as the layer tables, so they survive a
//! restart together with the optimistic local writes they mirror. The queue
//! never coalesces; two writes to the same field produce two entries and
//! replay applies both in order.

use std::sync::Arc;

use serde_json::Value;

use crate::{
    error::Result,
    storage::{LocalStore, NewPendingWrite, StorageBackend},
    sync::types::ReplayQueue,
    types::{EntityId, EntryId, PendingWriteEntry},
};

pub struct PendingWriteQueue<B: StorageBackend> {
    store: Arc<LocalStore<B>>,
}

impl<B: StorageBackend> Clone for PendingWriteQueue<B> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<B: StorageBackend> PendingWriteQueue<B> {
    pub fn new(store: Arc<LocalStore<B>>) -> Self {
        Self { store }
    }

    /// Append a write stamped with the current wall-clock time.
    pub fn enqueue(
        &self,
        target_collection: &str,
        entity_id: &EntityId,
        payload: Value,
    ) -> Result<EntryId> {
        self.enqueue_at(
            target_collection,
            entity_id,
            payload,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    /// Append a write with an explicit `created_at` (epoch millis).
    pub fn enqueue_at(
        &self,
        target_collection: &str,
        entity_id: &EntityId,
        payload: Value,
        created_at: i64,
    ) -> Result<EntryId> {
        let local_id = self.store.backend().append_pending(&NewPendingWrite {
            target_collection: target_collection.to_string(),
            entity_id: entity_id.clone(),
            payload,
            created_at,
        })?;
        tracing::debug!(
            collection = target_collection,
            entity_id = %entity_id,
            local_id,
            "queued pending write"
        );
        Ok(local_id)
    }

    /// Every entry, oldest first.
    pub fn list_all(&self) -> Result<Vec<PendingWriteEntry>> {
        self.store.backend().list_pending()
    }

    /// Remove one entry. Returns whether it existed.
    pub fn remove(&self, local_id: EntryId) -> Result<bool> {
        Ok(self.remove_many(&[local_id])? == 1)
    }

    /// Remove a set of entries in one transaction.
    pub fn remove_many(&self, ids: &[EntryId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.store.backend().remove_pending(ids)
    }

    pub fn record_attempt(&self, ids: &[EntryId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.store.backend().bump_pending_attempts(ids)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.list_all()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Entries targeting one entity, oldest first.
    pub fn pending_for(&self, entity_id: &EntityId) -> Result<Vec<PendingWriteEntry>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|e| &e.entity_id == entity_id)
            .collect())
    }
}

impl<B: StorageBackend + 'static> ReplayQueue for PendingWriteQueue<B> {
    fn list_all(&self) -> Result<Vec<PendingWriteEntry>> {
        PendingWriteQueue::list_all(self)
    }

    fn remove_many(&self, ids: &[EntryId]) -> Result<usize> {
        PendingWriteQueue::remove_many(self, ids)
    }

    fn record_attempt(&self, ids: &[EntryId]) -> Result<()> {
        PendingWriteQueue::record_attempt(self, ids)
    }
}
