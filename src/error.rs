use thiserror::Error;

use crate::types::Table;

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    /// The local device refused the write because it is out of space (or the
    /// backend's configured capacity was reached). Previously committed
    /// chunks are untouched.
    #[error("Local storage quota exceeded while writing to \"{table}\"")]
    QuotaExceeded { table: String },

    #[error("Storage backend not initialized. Call initialize() first.")]
    NotInitialized,

    #[error("Unknown index \"{index}\" on table \"{table}\"")]
    UnknownIndex { table: Table, index: String },

    #[error("Storage corruption in {table}/{id}: {message}")]
    Corruption {
        table: String,
        id: String,
        message: String,
    },

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    /// Whether this error is the distinct out-of-space kind.
    pub fn is_quota(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// Classification applied by the remote adapter before an error reaches the
/// sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Rate limit, write quota or resource exhaustion on the remote side.
    Quota,
    /// Offline, DNS, connection reset, timeout.
    Network,
    Other,
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteErrorKind::Quota => write!(f, "quota"),
            RemoteErrorKind::Network => write!(f, "network"),
            RemoteErrorKind::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("Remote {kind} error: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Quota, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Other, message)
    }
}

// ---------------------------------------------------------------------------
// ImportError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Import source is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Import source must be a JSON array of records, found {0}")]
    NotAnArray(String),
}

// ---------------------------------------------------------------------------
// CanvassError: top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CanvassError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CanvassError {
    /// True for local out-of-space failures, regardless of wrapping.
    pub fn is_storage_quota(&self) -> bool {
        matches!(self, CanvassError::Storage(e) if e.is_quota())
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for CanvassError {
    fn from(e: rusqlite::Error) -> Self {
        CanvassError::Storage(StorageError::Sqlite(e))
    }
}

/// Convenience alias: the default error type is `CanvassError`.
pub type Result<T, E = CanvassError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
