pub mod file;
pub mod sqlite;

pub use file::JsonFileStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use tracing::info;

use common::{Config, Result, StateStore};

/// The configured store: SQLite when `DATABASE_URL` is set, JSON file otherwise.
pub async fn open(config: &Config) -> Result<Arc<dyn StateStore>> {
    match &config.database_url {
        Some(url) => Ok(Arc::new(SqliteStore::connect(url).await?)),
        None => {
            info!(path = %config.state_path, "Using JSON file state store");
            Ok(Arc::new(JsonFileStore::new(&config.state_path)))
        }
    }
}
