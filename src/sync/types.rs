//! Sync-specific types: the queue interface the engine drains, replay
//! outcomes, and progress reporting.

use std::sync::Arc;

use crate::{
    error::{RemoteErrorKind, Result},
    remote::RemoteStoreAdapter,
    types::{EntryId, PendingWriteEntry},
};

use super::connectivity::Connectivity;

// ============================================================================
// ReplayQueue: storage interface for replay
// ============================================================================

/// Narrow queue interface covering only what `SyncEngine` needs.
///
/// `PendingWriteQueue<B>` implements it for every backend, which lets the
/// engine hold an `Arc<dyn ReplayQueue>` and lets tests substitute a queue
/// that fails on demand.
///
/// # Threading
/// All methods are synchronous and block the calling task briefly.
pub trait ReplayQueue: Send + Sync {
    fn list_all(&self) -> Result<Vec<PendingWriteEntry>>;
    fn remove_many(&self, ids: &[EntryId]) -> Result<usize>;
    fn record_attempt(&self, ids: &[EntryId]) -> Result<()>;
}

// ============================================================================
// Outcome Types
// ============================================================================

/// Why a replay pass ended before draining the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Remote quota exhausted; nothing from the failed batch was touched.
    Quota,
    /// Network failure or connectivity lost mid-pass.
    Network,
    /// Any other remote failure.
    Remote,
    /// The local queue could not be read or updated.
    LocalStorage,
}

impl From<RemoteErrorKind> for StopReason {
    fn from(kind: RemoteErrorKind) -> Self {
        match kind {
            RemoteErrorKind::Quota => StopReason::Quota,
            RemoteErrorKind::Network => StopReason::Network,
            RemoteErrorKind::Other => StopReason::Remote,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StopReason::Quota => "quota",
            StopReason::Network => "network",
            StopReason::Remote => "remote",
            StopReason::LocalStorage => "local-storage",
        };
        f.write_str(name)
    }
}

/// Counters for one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries acknowledged by the remote and removed from the queue
    pub uploaded: usize,
    /// Entries still queued when the pass ended
    pub remaining: usize,
    /// `commit_batch` calls issued, including a failed last one
    pub batches: usize,
}

/// Result of `SyncEngine::attempt_replay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Device offline; nothing attempted.
    Offline,
    /// Another pass holds the guard; this call was a no-op.
    AlreadyRunning,
    /// The queue was drained (possibly it was already empty).
    Completed(ReplayReport),
    /// The pass stopped early. Entries from the failed batch are still queued.
    Stopped {
        report: ReplayReport,
        reason: StopReason,
        message: String,
    },
}

impl ReplayOutcome {
    pub fn report(&self) -> Option<&ReplayReport> {
        match self {
            ReplayOutcome::Completed(report) | ReplayOutcome::Stopped { report, .. } => {
                Some(report)
            }
            ReplayOutcome::Offline | ReplayOutcome::AlreadyRunning => None,
        }
    }

    pub fn uploaded(&self) -> usize {
        self.report().map_or(0, |r| r.uploaded)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            ReplayOutcome::Stopped { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Progress callback payload. Fired after every acknowledged batch and once
/// more when a pass stops early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    pub uploaded: usize,
    pub remaining: usize,
    pub stopped: Option<StopReason>,
}

// ============================================================================
// SyncEngine Options
// ============================================================================

/// Callback type for replay progress updates.
pub type SyncProgressCallback = dyn Fn(&SyncProgress) + Send + Sync;

/// Configuration for `SyncEngine`.
pub struct SyncEngineOptions {
    pub queue: Arc<dyn ReplayQueue>,
    pub remote: Arc<dyn RemoteStoreAdapter>,
    pub connectivity: Connectivity,
    /// Entries per `commit_batch` (`None` = 200, clamped to `1..=200`)
    pub max_batch_size: Option<usize>,
    /// Called to report progress
    pub on_progress: Option<Arc<SyncProgressCallback>>,
}
