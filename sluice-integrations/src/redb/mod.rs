//! Redb is a simple, portable, high-performance, ACID, embedded key-value store.
//!
//! [`RedbStore`] durably keeps both source configurations and checkpoints in a single file,
//! without the need for external services. Every mutation is a single write transaction that is
//! fsynced before the call returns.
//!
//! # Example
//!
//! ```no_run
//! # use sluice_integrations::redb::RedbStore;
//! let store = RedbStore::builder()
//!     .database_path("/var/lib/sluice/state.redb")
//!     .build()
//!     .unwrap();
//! ```
use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use derive_builder::Builder;
use redb::TableDefinition;

use sluice_core::errors::CheckpointError;

mod checkpoints;
mod sources;

/// Source id to JSON encoded config
const SOURCES: TableDefinition<&str, &str> = TableDefinition::new("sources");
/// Sources that accept commits, with the incarnation they are live under
const LIVE_SOURCES: TableDefinition<&str, u128> = TableDefinition::new("live_source_incarnations");
/// `source_id/partition_id` to position
const CHECKPOINTS: TableDefinition<&str, &str> = TableDefinition::new("checkpoints");

#[derive(Clone, Builder)]
#[builder(build_fn(error = "anyhow::Error"))]
pub struct RedbStore {
    #[builder(setter(into), default = "Arc::new(self.default_database()?)")]
    database: Arc<redb::Database>,

    /// Path to the database, required if no database override is provided
    #[builder(setter(into, strip_option), default)]
    database_path: Option<PathBuf>,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("database", &self.database)
            .field("database_path", &self.database_path)
            .finish()
    }
}

impl RedbStoreBuilder {
    fn default_database(&self) -> Result<redb::Database> {
        let path = self
            .database_path
            .clone()
            .flatten()
            .ok_or(anyhow::anyhow!("Expected database path"))?;
        redb::Database::create(&path)
            .with_context(|| format!("Failed to open redb database at {}", path.display()))
    }
}

impl RedbStore {
    pub fn builder() -> RedbStoreBuilder {
        RedbStoreBuilder::default()
    }

    /// Runs a blocking redb operation off the async runtime.
    async fn blocking<T, F>(&self, operation: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&redb::Database) -> Result<T, CheckpointError> + Send + 'static,
    {
        let database = self.database.clone();
        tokio::task::spawn_blocking(move || operation(&database))
            .await
            .map_err(storage)?
    }
}

fn storage(err: impl Into<anyhow::Error>) -> CheckpointError {
    CheckpointError::Storage(err.into())
}

/// Opens a table for reading, treating a table that was never written to as empty.
fn open_read_table<K: redb::Key + 'static, V: redb::Value + 'static>(
    txn: &redb::ReadTransaction,
    definition: TableDefinition<K, V>,
) -> Result<Option<redb::ReadOnlyTable<K, V>>, CheckpointError> {
    match txn.open_table(definition) {
        Ok(table) => Ok(Some(table)),
        Err(redb::TableError::TableDoesNotExist { .. }) => Ok(None),
        Err(err) => Err(storage(err)),
    }
}
