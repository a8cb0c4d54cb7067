pub mod connectivity;
pub mod engine;
pub mod scheduler;
pub mod types;

pub use connectivity::Connectivity;
pub use engine::SyncEngine;
pub use scheduler::{SyncScheduler, DEFAULT_SYNC_INTERVAL};
pub use types::{
    ReplayOutcome, ReplayQueue, ReplayReport, StopReason, SyncEngineOptions, SyncProgress,
    SyncProgressCallback,
};
