//! Canvass: composition root wiring store, queue, writer and sync together.
//!
//! One `Canvass` per device database. Nothing runs in the background until
//! `start`; `shutdown` stops the scheduler. Construct it inside a Tokio
//! runtime if writes or the scheduler will be used.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    config::EngineConfig,
    error::Result,
    import::{self, ImportOptions, ImportReport},
    merge,
    normalize::RawIdentifier,
    queue::PendingWriteQueue,
    remote::RemoteStoreAdapter,
    storage::{LocalStore, StorageBackend},
    sync::{
        Connectivity, ReplayOutcome, SyncEngine, SyncEngineOptions, SyncProgressCallback,
        SyncScheduler,
    },
    types::MergedView,
    writer::{OptimisticWriter, WriteHandle},
};

pub struct Canvass<B: StorageBackend + 'static> {
    store: Arc<LocalStore<B>>,
    queue: PendingWriteQueue<B>,
    writer: OptimisticWriter<B>,
    engine: Arc<SyncEngine>,
    scheduler: SyncScheduler,
    connectivity: Connectivity,
}

impl<B: StorageBackend + 'static> Canvass<B> {
    /// Wire everything over an initialized backend.
    pub fn new(
        backend: B,
        remote: Arc<dyn RemoteStoreAdapter>,
        config: &EngineConfig,
        on_progress: Option<Arc<SyncProgressCallback>>,
    ) -> Self {
        let store = Arc::new(LocalStore::new(backend, config.store_options()));
        let queue = PendingWriteQueue::new(Arc::clone(&store));
        let connectivity = Connectivity::new(config.start_online);

        let engine = Arc::new(SyncEngine::new(SyncEngineOptions {
            queue: Arc::new(queue.clone()),
            remote: Arc::clone(&remote),
            connectivity: connectivity.clone(),
            max_batch_size: Some(config.max_batch_size),
            on_progress,
        }));
        let scheduler = SyncScheduler::new(Arc::clone(&engine), Some(config.sync_interval()));
        let writer = OptimisticWriter::new(
            Arc::clone(&store),
            queue.clone(),
            remote,
            connectivity.clone(),
            config.writer_options(),
        );

        Self {
            store,
            queue,
            writer,
            engine,
            scheduler,
            connectivity,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start background replay (interval and reconnect triggers).
    pub fn start(&self) {
        self.scheduler.start();
    }

    pub async fn shutdown(&self) {
        self.scheduler.dispose().await;
    }

    /// Report a connectivity change from the host platform. Regaining
    /// connectivity wakes the scheduler.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn store(&self) -> &Arc<LocalStore<B>> {
        &self.store
    }

    pub fn queue(&self) -> &PendingWriteQueue<B> {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn view(&self, raw_id: impl Into<RawIdentifier>) -> Result<Option<MergedView>> {
        merge::merge_view(&*self.store, Some(&self.queue), raw_id)
    }

    /// Merged views of every voter in one precinct.
    pub fn precinct(&self, precinct: &Value) -> Result<Vec<MergedView>> {
        merge::merge_indexed(&*self.store, Some(&self.queue), "precinct", precinct)
    }

    pub fn touched(&self) -> Result<Vec<MergedView>> {
        merge::touched_entities(&*self.store, Some(&self.queue))
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    pub fn set_dynamic_field(
        &self,
        raw_id: impl Into<RawIdentifier>,
        field: &str,
        value: Value,
        updated_at: i64,
    ) -> Result<WriteHandle> {
        self.writer.set_dynamic_field(raw_id, field, value, updated_at)
    }

    pub fn save_survey(
        &self,
        raw_id: impl Into<RawIdentifier>,
        fields: Map<String, Value>,
        updated_at: i64,
    ) -> Result<WriteHandle> {
        self.writer.save_survey(raw_id, fields, updated_at)
    }

    pub async fn import_json(
        &self,
        source: &str,
        options: &ImportOptions,
        cancel: &CancellationToken,
    ) -> Result<ImportReport> {
        import::import_json(&*self.store, source, options, cancel).await
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    pub async fn sync_now(&self) -> ReplayOutcome {
        self.scheduler.sync_now().await
    }
}

#[cfg(feature = "sqlite")]
impl Canvass<crate::storage::SqliteBackend> {
    /// Open (or create) the SQLite database named by `config.database_path`,
    /// or an in-memory one when it is unset.
    pub fn open(
        config: &EngineConfig,
        remote: Arc<dyn RemoteStoreAdapter>,
        on_progress: Option<Arc<SyncProgressCallback>>,
    ) -> Result<Self> {
        use crate::storage::{default_indexes, SqliteBackend, SqliteOptions};

        let mut backend = match &config.database_path {
            Some(path) => SqliteBackend::open(&path.to_string_lossy())?,
            None => SqliteBackend::open_in_memory()?,
        };
        backend.initialize(&default_indexes(), &SqliteOptions::default())?;
        tracing::debug!(path = ?config.database_path, "local database opened");
        Ok(Self::new(backend, remote, config, on_progress))
    }
}
