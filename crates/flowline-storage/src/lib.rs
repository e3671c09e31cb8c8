//! Session persistence backends.

mod json_file;
mod memory;
mod sqlite;

use std::sync::Arc;

use tracing::info;

use flowline_core::config::{StorageBackend, StorageConfig};
use flowline_core::error::Result;
use flowline_core::traits::SessionStorage;

pub use json_file::JsonFileStorage;
pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

/// Open the backend named in the config and prepare it for use.
pub async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn SessionStorage>> {
    let storage: Arc<dyn SessionStorage> = match config.backend {
        StorageBackend::Memory => Arc::new(InMemoryStorage::new()),
        StorageBackend::Sqlite => Arc::new(SqliteStorage::open(&config.resolved_path())?),
        StorageBackend::Json => Arc::new(JsonFileStorage::new(config.resolved_path())),
    };
    storage.create().await?;
    info!(backend = storage.name(), "Session storage ready");
    Ok(storage)
}
