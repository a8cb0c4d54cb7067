/// Storage backend trait for canvass-sync.
///
/// `StorageBackend` is the narrow raw I/O trait implemented by concrete
/// backends (SQLite, in-memory). Typed layer semantics live one level up in
/// `LocalStore`; the pending-write log shares the backend so both survive the
/// same restarts.
use serde_json::Value;

use crate::error::Result;
use crate::types::{EntityId, EntryId, PendingWriteEntry, StoredRow, Table};

use super::index::IndexDefinition;

/// A write about to be appended to the pending log (no id assigned yet).
#[derive(Debug, Clone)]
pub struct NewPendingWrite {
    pub target_collection: String,
    pub entity_id: EntityId,
    pub payload: Value,
    pub created_at: i64,
}

/// Low-level storage backend: raw row I/O with no layer semantics.
///
/// Implementors must be `Send + Sync` so they can be shared across tasks.
pub trait StorageBackend: Send + Sync {
    /// Fetch a single row by table and id.
    fn get_raw(&self, table: Table, id: &str) -> Result<Option<StoredRow>>;

    /// Persist (insert or replace) a row.
    fn put_raw(&self, row: &StoredRow) -> Result<()>;

    /// Atomically write multiple rows in a single backend transaction.
    ///
    /// Either every row is written or none is; a quota failure leaves the
    /// table as it was before the call.
    fn batch_put_raw(&self, rows: &[StoredRow]) -> Result<()>;

    /// All rows of a table, ordered by id.
    fn scan_raw(&self, table: Table) -> Result<Vec<StoredRow>>;

    /// Rows whose indexed field equals `value`.
    fn scan_index_raw(
        &self,
        index: &IndexDefinition,
        value: &Value,
    ) -> Result<Vec<StoredRow>>;

    /// Number of rows in a table.
    fn count_raw(&self, table: Table) -> Result<usize>;

    /// Read a metadata key-value pair.
    fn get_meta(&self, key: &str) -> Result<Option<String>>;

    /// Write a metadata key-value pair.
    fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Pending-write log
    // ------------------------------------------------------------------

    /// Append an entry and return its assigned id.
    fn append_pending(&self, entry: &NewPendingWrite) -> Result<EntryId>;

    /// Every entry in replay order (`created_at`, then insertion order).
    fn list_pending(&self) -> Result<Vec<PendingWriteEntry>>;

    /// Atomically delete the given entries. Unknown ids are ignored.
    /// Returns the number of entries removed.
    fn remove_pending(&self, ids: &[EntryId]) -> Result<usize>;

    /// Increment `attempts` on the given entries.
    fn bump_pending_attempts(&self, ids: &[EntryId]) -> Result<()>;
}
