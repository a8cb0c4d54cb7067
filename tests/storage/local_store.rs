//! LocalStore bulk-write behavior over the in-memory backend.

use canvass_sync::error::Result;
use canvass_sync::normalize::normalize;
use canvass_sync::storage::{
    IndexDefinition, LocalStore, LocalStoreOptions, MemoryBackend, NewPendingWrite,
    StorageBackend,
};
use canvass_sync::types::{BaseRecord, EntryId, LayerRecord, PendingWriteEntry, StoredRow, Table};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn base(i: usize) -> LayerRecord {
    let mut fields = serde_json::Map::new();
    fields.insert("precinct".into(), json!(i % 4));
    LayerRecord::Base(BaseRecord {
        entity_id: normalize(format!("M{i}")),
        raw_id: format!("M{i}"),
        fields,
    })
}

fn store_with(backend: impl StorageBackend, chunk_size: usize) -> LocalStore<impl StorageBackend> {
    LocalStore::new(
        backend,
        LocalStoreOptions {
            chunk_size: Some(chunk_size),
            indexes: None,
        },
    )
}

/// Backend that cancels a token once it has committed `after` batches.
struct CancelAfter {
    inner: MemoryBackend,
    token: CancellationToken,
    after: usize,
    batches: parking_lot::Mutex<usize>,
}

impl StorageBackend for CancelAfter {
    fn get_raw(&self, table: Table, id: &str) -> Result<Option<StoredRow>> {
        self.inner.get_raw(table, id)
    }

    fn put_raw(&self, row: &StoredRow) -> Result<()> {
        self.inner.put_raw(row)
    }

    fn batch_put_raw(&self, rows: &[StoredRow]) -> Result<()> {
        self.inner.batch_put_raw(rows)?;
        let mut batches = self.batches.lock();
        *batches += 1;
        if *batches == self.after {
            self.token.cancel();
        }
        Ok(())
    }

    fn scan_raw(&self, table: Table) -> Result<Vec<StoredRow>> {
        self.inner.scan_raw(table)
    }

    fn scan_index_raw(&self, index: &IndexDefinition, value: &Value) -> Result<Vec<StoredRow>> {
        self.inner.scan_index_raw(index, value)
    }

    fn count_raw(&self, table: Table) -> Result<usize> {
        self.inner.count_raw(table)
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_meta(key)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set_meta(key, value)
    }

    fn append_pending(&self, entry: &NewPendingWrite) -> Result<EntryId> {
        self.inner.append_pending(entry)
    }

    fn list_pending(&self) -> Result<Vec<PendingWriteEntry>> {
        self.inner.list_pending()
    }

    fn remove_pending(&self, ids: &[EntryId]) -> Result<usize> {
        self.inner.remove_pending(ids)
    }

    fn bump_pending_attempts(&self, ids: &[EntryId]) -> Result<()> {
        self.inner.bump_pending_attempts(ids)
    }
}

#[tokio::test]
async fn cancellation_keeps_committed_chunks() {
    let token = CancellationToken::new();
    let store = store_with(
        CancelAfter {
            inner: MemoryBackend::new(),
            token: token.clone(),
            after: 2,
            batches: parking_lot::Mutex::new(0),
        },
        10,
    );

    let records = (0..45).map(base).collect();
    let report = store.bulk_put(Table::Base, records, &token).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.committed, 20);
    assert_eq!(report.chunks, 2);
    assert_eq!(store.count(Table::Base).unwrap(), 20);
}

#[tokio::test]
async fn cancelled_before_start_writes_nothing() {
    let token = CancellationToken::new();
    token.cancel();
    let store = store_with(MemoryBackend::new(), 10);

    let report = store
        .bulk_put(Table::Base, (0..5).map(base).collect(), &token)
        .await
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.committed, 0);
    assert_eq!(store.count(Table::Base).unwrap(), 0);
}

#[tokio::test]
async fn retrying_a_partial_bulk_write_is_idempotent() {
    let store = store_with(MemoryBackend::with_capacity(30), 8);
    let first = store
        .bulk_put(Table::Base, (0..40).map(base).collect(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.committed, 30);

    let retry = store
        .bulk_put(Table::Base, (0..30).map(base).collect(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(retry.is_complete());
    assert_eq!(store.count(Table::Base).unwrap(), 30);
}

#[tokio::test]
async fn memory_index_scan_matches_sqlite_semantics() {
    let store = store_with(MemoryBackend::new(), 100);
    store
        .bulk_put(Table::Base, (0..12).map(base).collect(), &CancellationToken::new())
        .await
        .unwrap();

    let hits = store
        .scan_by_index(Table::Base, "precinct", &json!(1))
        .unwrap();
    let ids: Vec<&str> = hits.iter().map(|r| r.entity_id().as_str()).collect();
    assert_eq!(ids, vec!["M1", "M5", "M9"]);
}

#[test]
fn scan_all_returns_typed_records() {
    let store = store_with(MemoryBackend::new(), 100);
    store.put(base(1)).unwrap();
    store.put(base(2)).unwrap();
    let all = store.scan_all(Table::Base).unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|r| r.table() == Table::Base));
}
