//! MemoryBackend: a `StorageBackend` that keeps everything in process memory.
//!
//! Used for tests and for devices where durability is provided elsewhere.
//! An optional row capacity stands in for a device storage quota: writes
//! that would exceed it fail with `StorageError::QuotaExceeded` and leave the
//! store unchanged.
//!
//! ## Lock ordering
//!
//! `rows` → `capacity`, and `pending` and `meta` on their own. No method
//! acquires an earlier lock while holding a later one.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{CanvassError, Result, StorageError};
use crate::types::{EntryId, PendingWriteEntry, StoredRow, Table};

use super::index::IndexDefinition;
use super::traits::{NewPendingWrite, StorageBackend};

#[derive(Default)]
struct PendingLog {
    next_id: EntryId,
    entries: Vec<PendingWriteEntry>,
}

/// In-memory storage backend.
pub struct MemoryBackend {
    /// table → (id → row), ordered by id to match the SQLite scan order
    rows: Mutex<HashMap<Table, BTreeMap<String, StoredRow>>>,
    pending: Mutex<PendingLog>,
    meta: Mutex<HashMap<String, String>>,
    /// Maximum number of rows across all tables, `None` for unbounded.
    capacity: Mutex<Option<usize>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingLog {
                next_id: 1,
                entries: Vec::new(),
            }),
            meta: Mutex::new(HashMap::new()),
            capacity: Mutex::new(None),
        }
    }

    /// A backend that refuses to hold more than `max_rows` layer rows.
    pub fn with_capacity(max_rows: usize) -> Self {
        Self {
            capacity: Mutex::new(Some(max_rows)),
            ..Self::new()
        }
    }

    /// Change the row capacity, as when the device frees or loses space.
    /// Rows already stored are kept even if they exceed the new limit.
    pub fn set_capacity(&self, max_rows: Option<usize>) {
        *self.capacity.lock() = max_rows;
    }

    fn total_rows(rows: &HashMap<Table, BTreeMap<String, StoredRow>>) -> usize {
        rows.values().map(BTreeMap::len).sum()
    }

    /// Fail if inserting `incoming` rows would exceed the capacity.
    /// Overwrites of existing ids do not count against it.
    fn check_capacity(
        &self,
        rows: &HashMap<Table, BTreeMap<String, StoredRow>>,
        incoming: &[StoredRow],
    ) -> Result<()> {
        let Some(capacity) = *self.capacity.lock() else {
            return Ok(());
        };
        let mut fresh: Vec<(Table, &str)> = incoming
            .iter()
            .filter(|r| {
                rows.get(&r.table)
                    .map_or(true, |t| !t.contains_key(&r.id))
            })
            .map(|r| (r.table, r.id.as_str()))
            .collect();
        fresh.sort_unstable();
        fresh.dedup();

        if Self::total_rows(rows) + fresh.len() > capacity {
            let table = incoming.first().map_or("records", |r| r.table.name());
            return Err(CanvassError::Storage(StorageError::QuotaExceeded {
                table: table.to_string(),
            }));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Look up a JSON path of the form `$.a.b.c` inside `data`.
fn extract_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.trim_start_matches("$.")
        .split('.')
        .try_fold(data, |v, segment| v.get(segment))
}

impl StorageBackend for MemoryBackend {
    fn get_raw(&self, table: Table, id: &str) -> Result<Option<StoredRow>> {
        Ok(self
            .rows
            .lock()
            .get(&table)
            .and_then(|t| t.get(id))
            .cloned())
    }

    fn put_raw(&self, row: &StoredRow) -> Result<()> {
        self.batch_put_raw(std::slice::from_ref(row))
    }

    fn batch_put_raw(&self, rows: &[StoredRow]) -> Result<()> {
        let mut guard = self.rows.lock();
        self.check_capacity(&guard, rows)?;
        for row in rows {
            guard
                .entry(row.table)
                .or_default()
                .insert(row.id.clone(), row.clone());
        }
        Ok(())
    }

    fn scan_raw(&self, table: Table) -> Result<Vec<StoredRow>> {
        Ok(self
            .rows
            .lock()
            .get(&table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    fn scan_index_raw(&self, index: &IndexDefinition, value: &Value) -> Result<Vec<StoredRow>> {
        let path = index.path();
        Ok(self
            .rows
            .lock()
            .get(&index.table)
            .map(|t| {
                t.values()
                    .filter(|row| {
                        let found = extract_path(&row.data, &path).unwrap_or(&Value::Null);
                        found == value
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn count_raw(&self, table: Table) -> Result<usize> {
        Ok(self.rows.lock().get(&table).map_or(0, BTreeMap::len))
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self.meta.lock().get(key).cloned())
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.meta.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn append_pending(&self, entry: &NewPendingWrite) -> Result<EntryId> {
        let mut log = self.pending.lock();
        let local_id = log.next_id;
        log.next_id += 1;
        log.entries.push(PendingWriteEntry {
            local_id,
            target_collection: entry.target_collection.clone(),
            entity_id: entry.entity_id.clone(),
            payload: entry.payload.clone(),
            created_at: entry.created_at,
            attempts: 0,
        });
        Ok(local_id)
    }

    fn list_pending(&self) -> Result<Vec<PendingWriteEntry>> {
        let mut entries = self.pending.lock().entries.clone();
        entries.sort_by_key(|e| (e.created_at, e.local_id));
        Ok(entries)
    }

    fn remove_pending(&self, ids: &[EntryId]) -> Result<usize> {
        let mut log = self.pending.lock();
        let before = log.entries.len();
        log.entries.retain(|e| !ids.contains(&e.local_id));
        Ok(before - log.entries.len())
    }

    fn bump_pending_attempts(&self, ids: &[EntryId]) -> Result<()> {
        let mut log = self.pending.lock();
        for entry in log.entries.iter_mut().filter(|e| ids.contains(&e.local_id)) {
            entry.attempts += 1;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
