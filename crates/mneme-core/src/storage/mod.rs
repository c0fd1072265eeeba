//! Storage layer for Mneme
//!
//! Two interchangeable backends implement [`StorageProvider`]:
//! - [`FileStorageProvider`]: a single JSON document, current versions only
//! - [`SqliteStorageProvider`]: versioned rows with history, point-in-time
//!   reads and native similarity search

pub mod database;
pub mod file;
pub mod migrations;
pub mod provider;
pub mod sqlite;

use std::sync::Arc;

pub use database::{Database, DatabaseConfig};
pub use file::FileStorageProvider;
pub use migrations::{CURRENT_VERSION, MigrationStatus, run_migrations};
pub use provider::{
    EntityOutcome, EntityWriteResult, HistoryQueryable, ObservationAddition, ObservationDeletion,
    ObservationResult, RelationOutcome, RelationWriteResult, SemanticMatch, SemanticSearchOptions,
    SemanticSearchable, StorageProvider, VectorCapable,
};
pub use sqlite::SqliteStorageProvider;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{Result, StorageContext};

/// Open the backend selected by `config`, creating the data directory.
///
/// For SQLite the database handle is returned too, so callers can share its
/// pool with the vector index.
pub async fn open_storage(
    config: &StorageConfig,
) -> Result<(Arc<dyn StorageProvider>, Option<Database>)> {
    match config.backend {
        StorageBackend::File => {
            if let Some(parent) = config.file_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .storage_context("create_dir", parent.display().to_string())?;
            }
            tracing::info!(path = %config.file_path.display(), "Using JSON file storage");
            Ok((Arc::new(FileStorageProvider::new(&config.file_path)), None))
        }
        StorageBackend::Sqlite => {
            tracing::info!(path = %config.database_path.display(), "Using SQLite storage");
            let database = Database::new(
                DatabaseConfig::with_path(&config.database_path)
                    .max_connections(config.max_connections),
            )
            .await?;
            let provider = SqliteStorageProvider::from_database(&database);
            Ok((Arc::new(provider), Some(database)))
        }
    }
}
