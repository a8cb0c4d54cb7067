//! LocalStore<B>: typed layer tables on top of any `StorageBackend`.
//!
//! The store is document-level: `put` replaces a record wholesale. Field-level
//! patching of dynamic overlays is a read-modify-write done by the caller
//! (see `writer`), so the timestamp rule is applied in exactly one place.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CanvassError, Result, StorageError},
    normalize::{normalize, RawIdentifier},
    types::{
        BaseRecord, BulkPutReport, DynamicOverlay, EntityId, LayerRecord, StoredRow,
        SurveyOverlay, Table,
    },
};

use super::index::{default_indexes, find_index, IndexDefinition};
use super::traits::StorageBackend;

/// Rows written per backend transaction during bulk writes.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Configuration for `LocalStore`.
#[derive(Debug, Clone, Default)]
pub struct LocalStoreOptions {
    /// Bulk-write chunk size (`None` = default 1000)
    pub chunk_size: Option<usize>,
    /// Secondary indexes known to `scan_by_index` (`None` = `default_indexes()`).
    /// Must match the indexes the backend was initialized with.
    pub indexes: Option<Vec<IndexDefinition>>,
}

// ============================================================================
// LocalStore
// ============================================================================

pub struct LocalStore<B: StorageBackend> {
    backend: B,
    indexes: Vec<IndexDefinition>,
    chunk_size: usize,
}

impl<B: StorageBackend> LocalStore<B> {
    /// Wrap an initialized backend.
    pub fn new(backend: B, options: LocalStoreOptions) -> Self {
        Self {
            backend,
            indexes: options.indexes.unwrap_or_else(default_indexes),
            chunk_size: options.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn indexes(&self) -> &[IndexDefinition] {
        &self.indexes
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Fetch a record by (un-normalized) key.
    pub fn get(&self, table: Table, key: impl Into<RawIdentifier>) -> Result<Option<LayerRecord>> {
        let id = normalize(key);
        self.backend
            .get_raw(table, id.as_str())?
            .map(decode_row)
            .transpose()
    }

    pub fn get_base(&self, id: &EntityId) -> Result<Option<BaseRecord>> {
        Ok(self.get(Table::Base, id)?.and_then(LayerRecord::into_base))
    }

    pub fn get_survey(&self, id: &EntityId) -> Result<Option<SurveyOverlay>> {
        Ok(self.get(Table::Survey, id)?.and_then(LayerRecord::into_survey))
    }

    pub fn get_dynamic(&self, id: &EntityId) -> Result<Option<DynamicOverlay>> {
        Ok(self
            .get(Table::Dynamic, id)?
            .and_then(LayerRecord::into_dynamic))
    }

    /// Records whose indexed field equals `value`, without a full scan.
    pub fn scan_by_index(
        &self,
        table: Table,
        index_name: &str,
        value: &Value,
    ) -> Result<Vec<LayerRecord>> {
        let index = find_index(&self.indexes, table, index_name).ok_or_else(|| {
            CanvassError::Storage(StorageError::UnknownIndex {
                table,
                index: index_name.to_string(),
            })
        })?;
        self.backend
            .scan_index_raw(index, value)?
            .into_iter()
            .map(decode_row)
            .collect()
    }

    /// Every record of a table, ordered by entity id.
    pub fn scan_all(&self, table: Table) -> Result<Vec<LayerRecord>> {
        self.backend
            .scan_raw(table)?
            .into_iter()
            .map(decode_row)
            .collect()
    }

    pub fn count(&self, table: Table) -> Result<usize> {
        self.backend.count_raw(table)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Upsert by primary key, replacing any previous version wholesale.
    pub fn put(&self, record: impl Into<LayerRecord>) -> Result<()> {
        let row = encode_record(&record.into())?;
        self.backend.put_raw(&row)
    }

    /// Chunked bulk upsert.
    ///
    /// Each chunk is one backend transaction and the task yields between
    /// chunks. Cancellation stops issuing chunks; a quota failure ends the run
    /// with the error in the report. Either way committed chunks stay written
    /// and a retry of the same records is a harmless overwrite.
    pub async fn bulk_put(
        &self,
        table: Table,
        records: Vec<LayerRecord>,
        cancel: &CancellationToken,
    ) -> Result<BulkPutReport> {
        let rows = records
            .iter()
            .map(|record| {
                if record.table() != table {
                    return Err(CanvassError::Internal(format!(
                        "bulk_put into \"{table}\" received a \"{}\" record",
                        record.table()
                    )));
                }
                encode_record(record)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut report = BulkPutReport::default();
        for chunk in rows.chunks(self.chunk_size) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match self.put_chunk(chunk, &mut report.committed) {
                Ok(()) => report.chunks += 1,
                Err(CanvassError::Storage(e)) if e.is_quota() => {
                    tracing::warn!(
                        table = %table,
                        committed = report.committed,
                        total = rows.len(),
                        error = %e,
                        "local storage quota reached during bulk write; committed chunks kept"
                    );
                    report.error = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }

            tokio::task::yield_now().await;
        }

        tracing::debug!(
            table = %table,
            committed = report.committed,
            chunks = report.chunks,
            cancelled = report.cancelled,
            "bulk write finished"
        );
        Ok(report)
    }

    /// Write `chunk`, halving it on quota errors so that as much as fits is
    /// kept. Fails once a single row no longer fits.
    fn put_chunk(&self, chunk: &[StoredRow], committed: &mut usize) -> Result<()> {
        match self.backend.batch_put_raw(chunk) {
            Ok(()) => {
                *committed += chunk.len();
                Ok(())
            }
            Err(e) if e.is_storage_quota() && chunk.len() > 1 => {
                let (left, right) = chunk.split_at(chunk.len() / 2);
                self.put_chunk(left, committed)?;
                self.put_chunk(right, committed)
            }
            Err(e) => Err(e),
        }
    }
}

fn encode_record(record: &LayerRecord) -> Result<StoredRow> {
    StoredRow::from_record(record)
        .map_err(|e| CanvassError::Internal(format!("serialize {} record: {e}", record.table())))
}

fn decode_row(row: StoredRow) -> Result<LayerRecord> {
    let table = row.table;
    let id = row.id.clone();
    row.into_record().map_err(|e| {
        CanvassError::Storage(StorageError::Corruption {
            table: table.name().to_string(),
            id,
            message: e.to_string(),
        })
    })
}
