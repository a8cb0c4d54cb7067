//! SQLite storage backend for canvass-sync.
//!
//! Implements `StorageBackend` using rusqlite (bundled). One connection sits
//! behind a `parking_lot::Mutex`; multi-statement writes hold the lock for
//! the whole of their transaction.

use parking_lot::Mutex;
use rusqlite::{params, ErrorCode, OptionalExtension};
use serde_json::Value;

use crate::error::{CanvassError, Result, StorageError};
use crate::types::{EntityId, EntryId, PendingWriteEntry, StoredRow, Table};

use super::index::IndexDefinition;
use super::traits::{NewPendingWrite, StorageBackend};

const PENDING_TABLE: &str = "pending_writes";

// ============================================================================
// Value helpers
// ============================================================================

/// Convert a `serde_json::Value` to a `rusqlite::types::Value` for query params.
fn json_value_to_sql(v: &Value) -> rusqlite::types::Value {
    match v {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(if *b { 1 } else { 0 }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        // Arrays and objects stored as JSON strings in SQLite
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

/// Map a rusqlite error to a `CanvassError`, surfacing `SQLITE_FULL` as the
/// distinct quota kind.
fn storage_err(target: &str) -> impl Fn(rusqlite::Error) -> CanvassError + '_ {
    move |e| {
        if e.sqlite_error_code() == Some(ErrorCode::DiskFull) {
            CanvassError::Storage(StorageError::QuotaExceeded {
                table: target.to_string(),
            })
        } else {
            CanvassError::Storage(StorageError::Sqlite(e))
        }
    }
}

fn serialize_data(row: &StoredRow) -> Result<String> {
    serde_json::to_string(&row.data)
        .map_err(|e| CanvassError::Internal(format!("serialize data: {e}")))
}

// ============================================================================
// SqliteBackend
// ============================================================================

/// Options applied when the database is opened.
#[derive(Debug, Clone, Default)]
pub struct SqliteOptions {
    /// Upper bound on database pages (`PRAGMA max_page_count`). Writes past
    /// it fail with `StorageError::QuotaExceeded`.
    pub max_page_count: Option<u32>,
}

/// SQLite storage backend.
pub struct SqliteBackend {
    conn: Mutex<rusqlite::Connection>,
    indexes: Vec<IndexDefinition>,
    initialized: bool,
}

impl SqliteBackend {
    /// Open a file-backed SQLite database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = rusqlite::Connection::open(path).map_err(storage_err(path))?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory SQLite database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(storage_err(":memory:"))?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: rusqlite::Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            indexes: Vec::new(),
            initialized: false,
        }
    }

    /// Initialize tables, pragmas, and the given secondary indexes.
    pub fn initialize(&mut self, indexes: &[IndexDefinition], options: &SqliteOptions) -> Result<()> {
        {
            let conn = self.conn.lock();
            let err = storage_err("schema");

            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout=5000;",
            )
            .map_err(&err)?;

            if let Some(pages) = options.max_page_count {
                // The pragma echoes the new limit back as a row.
                conn.query_row(&format!("PRAGMA max_page_count = {pages}"), [], |_| Ok(()))
                    .map_err(&err)?;
            }

            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS records (
                    tbl   TEXT NOT NULL,
                    id    TEXT NOT NULL,
                    data  TEXT NOT NULL DEFAULT '{}',
                    PRIMARY KEY (tbl, id)
                );
                CREATE TABLE IF NOT EXISTS pending_writes (
                    local_id          INTEGER PRIMARY KEY AUTOINCREMENT,
                    target_collection TEXT NOT NULL,
                    entity_id         TEXT NOT NULL,
                    payload           TEXT NOT NULL,
                    created_at        INTEGER NOT NULL,
                    attempts          INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_pending_order
                    ON pending_writes(created_at, local_id);
                CREATE INDEX IF NOT EXISTS idx_pending_entity
                    ON pending_writes(entity_id);
                CREATE TABLE IF NOT EXISTS meta (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );",
            )
            .map_err(&err)?;

            conn.execute(
                "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema:version', '1')",
                [],
            )
            .map_err(&err)?;
        }

        for index in indexes {
            self.create_index(index)?;
        }
        self.indexes = indexes.to_vec();
        self.initialized = true;
        Ok(())
    }

    /// Returns whether `initialize()` has been called.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn check_initialized(&self) -> Result<()> {
        if !self.initialized {
            return Err(CanvassError::Storage(StorageError::NotInitialized));
        }
        Ok(())
    }

    /// Create the SQL expression index backing an `IndexDefinition`.
    fn create_index(&self, index: &IndexDefinition) -> Result<()> {
        if !index.is_valid() {
            return Err(CanvassError::Internal(format!(
                "invalid index definition {}.{} on field {:?}",
                index.table, index.name, index.field
            )));
        }
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_{} ON records (tbl, json_extract(data, '{}'))",
            index.table.name(),
            index.name,
            index.path()
        );
        let conn = self.conn.lock();
        conn.execute_batch(&sql).map_err(storage_err("schema"))
    }

    /// Parse a single rusqlite row into a `StoredRow`.
    fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
        let tbl: String = row.get(0)?;
        let id: String = row.get(1)?;
        let data_str: String = row.get(2)?;

        let table = Table::from_name(&tbl)
            .ok_or_else(|| rusqlite::Error::InvalidParameterName(format!("table: {tbl}")))?;
        let data: Value = serde_json::from_str(&data_str)
            .map_err(|e| rusqlite::Error::InvalidParameterName(format!("data: {e}")))?;

        Ok(StoredRow { table, id, data })
    }

    fn row_to_pending(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingWriteEntry> {
        let local_id: i64 = row.get(0)?;
        let target_collection: String = row.get(1)?;
        let entity_id: String = row.get(2)?;
        let payload_str: String = row.get(3)?;
        let created_at: i64 = row.get(4)?;
        let attempts: i64 = row.get(5)?;

        let payload: Value = serde_json::from_str(&payload_str)
            .map_err(|e| rusqlite::Error::InvalidParameterName(format!("payload: {e}")))?;

        Ok(PendingWriteEntry {
            local_id,
            target_collection,
            entity_id: EntityId::from_normalized(entity_id),
            payload,
            created_at,
            attempts: attempts.max(0) as u32,
        })
    }

    /// Execute a row upsert inside `conn` (used by both `put_raw` and `batch_put_raw`).
    fn execute_put(
        conn: &rusqlite::Connection,
        row: &StoredRow,
        data_str: &str,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO records (tbl, id, data) VALUES (?1, ?2, ?3)",
            params![row.table.name(), row.id, data_str],
        )?;
        Ok(())
    }

    fn collect_rows(
        &self,
        sql: &str,
        params: &[rusqlite::types::Value],
        target: &str,
    ) -> Result<Vec<StoredRow>> {
        let conn = self.conn.lock();
        let err = storage_err(target);
        let mut stmt = conn.prepare_cached(sql).map_err(&err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), Self::row_to_stored)
            .map_err(&err)?;
        let rows: rusqlite::Result<Vec<_>> = rows.collect();
        rows.map_err(&err)
    }
}

// ============================================================================
// StorageBackend implementation
// ============================================================================

impl StorageBackend for SqliteBackend {
    fn get_raw(&self, table: Table, id: &str) -> Result<Option<StoredRow>> {
        self.check_initialized()?;
        let conn = self.conn.lock();
        let err = storage_err(table.name());
        let mut stmt = conn
            .prepare_cached("SELECT tbl, id, data FROM records WHERE tbl = ?1 AND id = ?2")
            .map_err(&err)?;

        stmt.query_row(params![table.name(), id], Self::row_to_stored)
            .optional()
            .map_err(&err)
    }

    fn put_raw(&self, row: &StoredRow) -> Result<()> {
        self.check_initialized()?;
        let data_str = serialize_data(row)?;
        let conn = self.conn.lock();
        Self::execute_put(&conn, row, &data_str).map_err(storage_err(row.table.name()))
    }

    fn batch_put_raw(&self, rows: &[StoredRow]) -> Result<()> {
        self.check_initialized()?;
        let Some(first) = rows.first() else {
            return Ok(());
        };
        let err = storage_err(first.table.name());

        let mut conn = self.conn.lock();
        // Dropping the transaction without commit rolls the whole batch back.
        let tx = conn.transaction().map_err(&err)?;
        for row in rows {
            let data_str = serialize_data(row)?;
            Self::execute_put(&tx, row, &data_str).map_err(&err)?;
        }
        tx.commit().map_err(&err)
    }

    fn scan_raw(&self, table: Table) -> Result<Vec<StoredRow>> {
        self.check_initialized()?;
        self.collect_rows(
            "SELECT tbl, id, data FROM records WHERE tbl = ?1 ORDER BY id",
            &[rusqlite::types::Value::Text(table.name().to_string())],
            table.name(),
        )
    }

    fn scan_index_raw(&self, index: &IndexDefinition, value: &Value) -> Result<Vec<StoredRow>> {
        self.check_initialized()?;
        // Must match the indexed expression exactly for SQLite to use it.
        let expr = format!("json_extract(data, '{}')", index.path());
        let table_param = rusqlite::types::Value::Text(index.table.name().to_string());

        if value.is_null() {
            let sql = format!(
                "SELECT tbl, id, data FROM records WHERE tbl = ?1 AND {expr} IS NULL ORDER BY id"
            );
            return self.collect_rows(&sql, &[table_param], index.table.name());
        }

        let sql =
            format!("SELECT tbl, id, data FROM records WHERE tbl = ?1 AND {expr} = ?2 ORDER BY id");
        self.collect_rows(
            &sql,
            &[table_param, json_value_to_sql(value)],
            index.table.name(),
        )
    }

    fn count_raw(&self, table: Table) -> Result<usize> {
        self.check_initialized()?;
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM records WHERE tbl = ?1",
            params![table.name()],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .map_err(storage_err(table.name()))
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let err = storage_err("meta");
        let mut stmt = conn
            .prepare_cached("SELECT value FROM meta WHERE key = ?1")
            .map_err(&err)?;
        stmt.query_row(params![key], |row| row.get::<_, String>(0))
            .optional()
            .map_err(&err)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map(|_| ())
        .map_err(storage_err("meta"))
    }

    fn append_pending(&self, entry: &NewPendingWrite) -> Result<EntryId> {
        self.check_initialized()?;
        let payload = serde_json::to_string(&entry.payload)
            .map_err(|e| CanvassError::Internal(format!("serialize payload: {e}")))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pending_writes (target_collection, entity_id, payload, created_at, attempts) \
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                entry.target_collection,
                entry.entity_id.as_str(),
                payload,
                entry.created_at
            ],
        )
        .map_err(storage_err(PENDING_TABLE))?;
        Ok(conn.last_insert_rowid())
    }

    fn list_pending(&self) -> Result<Vec<PendingWriteEntry>> {
        self.check_initialized()?;
        let conn = self.conn.lock();
        let err = storage_err(PENDING_TABLE);
        let mut stmt = conn
            .prepare_cached(
                "SELECT local_id, target_collection, entity_id, payload, created_at, attempts \
                 FROM pending_writes ORDER BY created_at, local_id",
            )
            .map_err(&err)?;
        let rows = stmt.query_map([], Self::row_to_pending).map_err(&err)?;
        let entries: rusqlite::Result<Vec<_>> = rows.collect();
        entries.map_err(&err)
    }

    fn remove_pending(&self, ids: &[EntryId]) -> Result<usize> {
        self.check_initialized()?;
        if ids.is_empty() {
            return Ok(0);
        }
        let err = storage_err(PENDING_TABLE);
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(&err)?;
        let mut removed = 0;
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM pending_writes WHERE local_id = ?1")
                .map_err(&err)?;
            for id in ids {
                removed += stmt.execute(params![id]).map_err(&err)?;
            }
        }
        tx.commit().map_err(&err)?;
        Ok(removed)
    }

    fn bump_pending_attempts(&self, ids: &[EntryId]) -> Result<()> {
        self.check_initialized()?;
        if ids.is_empty() {
            return Ok(());
        }
        let err = storage_err(PENDING_TABLE);
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(&err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "UPDATE pending_writes SET attempts = attempts + 1 WHERE local_id = ?1",
                )
                .map_err(&err)?;
            for id in ids {
                stmt.execute(params![id]).map_err(&err)?;
            }
        }
        tx.commit().map_err(&err)
    }
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("indexes", &self.indexes)
            .field("initialized", &self.initialized)
            .finish()
    }
}
