//! Engine configuration.
//!
//! Every field is optional in serialized form; missing fields take the
//! defaults below.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::{CanvassError, Result},
    remote::MAX_REMOTE_BATCH_SIZE,
    storage::{LocalStoreOptions, DEFAULT_CHUNK_SIZE},
    sync::DEFAULT_SYNC_INTERVAL,
    writer::{WriterOptions, DEFAULT_DIRECT_WRITE_TIMEOUT},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Rows per local bulk-write transaction
    pub chunk_size: usize,
    /// Queue entries per remote batch, clamped to `1..=200`
    pub max_batch_size: usize,
    pub sync_interval_ms: u64,
    pub direct_write_timeout_ms: u64,
    /// SQLite database file; `None` opens an in-memory database
    pub database_path: Option<PathBuf>,
    /// Start in the online state
    pub start_online: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_batch_size: MAX_REMOTE_BATCH_SIZE,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL.as_millis() as u64,
            direct_write_timeout_ms: DEFAULT_DIRECT_WRITE_TIMEOUT.as_millis() as u64,
            database_path: None,
            start_online: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json(source: &str) -> Result<Self> {
        serde_json::from_str(source)
            .map_err(|e| CanvassError::Internal(format!("invalid engine config: {e}")))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn direct_write_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_write_timeout_ms)
    }

    pub fn store_options(&self) -> LocalStoreOptions {
        LocalStoreOptions {
            chunk_size: Some(self.chunk_size),
            indexes: None,
        }
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            direct_write_timeout: Some(self.direct_write_timeout()),
        }
    }
}
