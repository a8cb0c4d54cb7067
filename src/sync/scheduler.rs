//! SyncScheduler: fires `SyncEngine::attempt_replay` from every trigger.
//!
//! Three triggers feed the same entry point: a fixed interval, an
//! offline → online transition, and explicit requests. Overlapping triggers
//! coalesce on the engine's re-entrancy guard, so at most one pass runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::SyncEngine;
use super::types::ReplayOutcome;

/// Interval between background replay attempts.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// SyncScheduler
// ============================================================================

pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    interval: Duration,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl SyncScheduler {
    /// Create a scheduler over `engine`.
    ///
    /// `interval` sets the background period (default: 30 s). Nothing runs
    /// until `start` is called.
    pub fn new(engine: Arc<SyncEngine>, interval: Option<Duration>) -> Self {
        Self {
            engine,
            interval: interval
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_SYNC_INTERVAL),
            trigger: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the background loop. Must be called inside a Tokio runtime.
    /// A second call, or a call after `dispose`, does nothing.
    pub fn start(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let engine = Arc::clone(&self.engine);
        let trigger = Arc::clone(&self.trigger);
        let cancel = self.cancel.clone();
        let interval = self.interval;
        *task = Some(tokio::spawn(run_loop(engine, trigger, cancel, interval)));
        tracing::debug!(interval_ms = interval.as_millis() as u64, "sync scheduler started");
    }

    pub fn is_started(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Ask the background loop for a pass without waiting for it.
    pub fn request_sync(&self) {
        self.trigger.notify_one();
    }

    /// Run a pass now and wait for its outcome. Returns
    /// `ReplayOutcome::AlreadyRunning` if a pass is already in flight.
    pub async fn sync_now(&self) -> ReplayOutcome {
        self.engine.attempt_replay().await
    }

    /// Stop the background loop and wait for it to exit. A pass started by the
    /// loop is abandoned at its next await; unacknowledged entries stay queued.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "sync scheduler task ended abnormally");
            }
        }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Background loop
// ============================================================================

async fn run_loop(
    engine: Arc<SyncEngine>,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut online = engine.connectivity().subscribe();
    let mut watching = true;

    loop {
        let cause = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => "interval",
            _ = trigger.notified() => "requested",
            changed = online.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                if !*online.borrow_and_update() {
                    continue;
                }
                "reconnected"
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = engine.attempt_replay() => outcome,
        };
        tracing::debug!(trigger = cause, outcome = ?outcome, "replay trigger handled");
    }

    tracing::debug!("sync scheduler stopped");
}
