//! SyncEngine: drains the pending-write queue into the remote store.
//!
//! `attempt_replay` never returns `Err`. Every failure ends the pass and is
//! reported in the `ReplayOutcome` and to the progress observer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{
    error::RemoteErrorKind,
    remote::{tag_last_synced, RemoteStoreAdapter, RemoteWrite, MAX_REMOTE_BATCH_SIZE},
    types::{EntryId, PendingWriteEntry},
};

use super::connectivity::Connectivity;
use super::types::*;

// ============================================================================
// SyncEngine
// ============================================================================

pub struct SyncEngine {
    queue: Arc<dyn ReplayQueue>,
    remote: Arc<dyn RemoteStoreAdapter>,
    connectivity: Connectivity,
    max_batch_size: usize,
    on_progress: Option<Arc<SyncProgressCallback>>,
    /// Held for the duration of one replay pass
    running: AtomicBool,
}

/// Releases the re-entrancy guard on drop, including when the replay future
/// is dropped mid-pass.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    pub fn new(options: SyncEngineOptions) -> Self {
        Self {
            queue: options.queue,
            remote: options.remote,
            connectivity: options.connectivity,
            max_batch_size: options
                .max_batch_size
                .unwrap_or(MAX_REMOTE_BATCH_SIZE)
                .clamp(1, MAX_REMOTE_BATCH_SIZE),
            on_progress: options.on_progress,
            running: AtomicBool::new(false),
        }
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Whether a replay pass is in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Upload every queued entry in batches, oldest first.
    ///
    /// Entries are removed only after the remote acknowledges their batch.
    /// A quota error leaves the queue exactly as it was; any other remote
    /// error also keeps the failed batch and bumps its attempt counters.
    pub async fn attempt_replay(&self) -> ReplayOutcome {
        if !self.connectivity.is_online() {
            tracing::debug!("replay skipped: offline");
            return ReplayOutcome::Offline;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("replay skipped: already running");
            return ReplayOutcome::AlreadyRunning;
        }
        let _guard = RunGuard(&self.running);

        self.replay_impl().await
    }

    // -----------------------------------------------------------------------
    // Replay Implementation
    // -----------------------------------------------------------------------

    async fn replay_impl(&self) -> ReplayOutcome {
        let entries = match self.queue.list_all() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "could not read pending writes");
                return self.stop(
                    ReplayReport::default(),
                    StopReason::LocalStorage,
                    e.to_string(),
                );
            }
        };

        let mut report = ReplayReport {
            uploaded: 0,
            remaining: entries.len(),
            batches: 0,
        };
        if entries.is_empty() {
            return ReplayOutcome::Completed(report);
        }
        tracing::debug!(
            pending = entries.len(),
            batch_size = self.max_batch_size,
            "replay started"
        );

        for batch in entries.chunks(self.max_batch_size) {
            if !self.connectivity.is_online() {
                return self.stop(report, StopReason::Network, "connectivity lost".to_string());
            }

            let ids: Vec<EntryId> = batch.iter().map(|e| e.local_id).collect();
            let writes = build_writes(batch, chrono::Utc::now().timestamp_millis());
            report.batches += 1;

            if let Err(e) = self.remote.commit_batch(&writes).await {
                let reason = StopReason::from(e.kind);
                if e.kind == RemoteErrorKind::Quota {
                    tracing::warn!(
                        uploaded = report.uploaded,
                        remaining = report.remaining,
                        error = %e,
                        "remote quota exceeded; replay halted with queue intact"
                    );
                } else {
                    tracing::warn!(
                        kind = %e.kind,
                        batch = report.batches,
                        error = %e,
                        "batch commit failed; entries kept for retry"
                    );
                    if let Err(bump) = self.queue.record_attempt(&ids) {
                        tracing::warn!(error = %bump, "could not record replay attempt");
                    }
                }
                return self.stop(report, reason, e.message);
            }

            // The batch is on the remote now. If removal fails the entries are
            // replayed again later, which the set-with-merge contract absorbs.
            if let Err(e) = self.queue.remove_many(&ids) {
                tracing::warn!(
                    batch = report.batches,
                    error = %e,
                    "committed batch could not be removed from the queue"
                );
                return self.stop(report, StopReason::LocalStorage, e.to_string());
            }

            report.uploaded += batch.len();
            report.remaining -= batch.len();
            self.report_progress(&report, None);
        }

        tracing::info!(
            uploaded = report.uploaded,
            batches = report.batches,
            "replay finished"
        );
        ReplayOutcome::Completed(report)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn stop(&self, report: ReplayReport, reason: StopReason, message: String) -> ReplayOutcome {
        self.report_progress(&report, Some(reason));
        ReplayOutcome::Stopped {
            report,
            reason,
            message,
        }
    }

    fn report_progress(&self, report: &ReplayReport, stopped: Option<StopReason>) {
        if let Some(ref on_progress) = self.on_progress {
            let progress = SyncProgress {
                uploaded: report.uploaded,
                remaining: report.remaining,
                stopped,
            };
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                on_progress(&progress);
            }));
        }
    }
}

fn build_writes(batch: &[PendingWriteEntry], synced_at: i64) -> Vec<RemoteWrite> {
    batch
        .iter()
        .map(|entry| RemoteWrite {
            collection: entry.target_collection.clone(),
            doc_id: entry.entity_id.as_str().to_string(),
            payload: tag_last_synced(&entry.payload, synced_at),
        })
        .collect()
}
