pub mod index;
pub mod local_store;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use index::{default_indexes, IndexDefinition};
pub use local_store::{LocalStore, LocalStoreOptions, DEFAULT_CHUNK_SIZE};
pub use memory::MemoryBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteBackend, SqliteOptions};
pub use traits::{NewPendingWrite, StorageBackend};
