pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use threadloom_core::config::{StoreBackend, StoreConfig};
use threadloom_core::error::Result;
use threadloom_core::traits::GraphStore;

pub use memory::MemoryGraphStore;
pub use sqlite::SqliteGraphStore;

/// Open the store selected by config.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn GraphStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryGraphStore::new())),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteGraphStore::open(&config.resolved_path())?)),
    }
}
