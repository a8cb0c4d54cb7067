//! Offline-first voter data store for field canvassing.
//!
//! Records live in three local layers (bulk-imported base data, survey
//! overlays, high-churn dynamic overlays) that are merged on every read.
//! Mutations land locally first; a durable queue replays them to the remote
//! store in bounded batches whenever connectivity allows.

pub mod canvass;
pub mod config;
pub mod error;
pub mod import;
pub mod merge;
pub mod normalize;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod types;
pub mod writer;

pub use canvass::Canvass;
pub use config::EngineConfig;
pub use error::{CanvassError, Result};
