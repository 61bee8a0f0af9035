use anyhow::{Context as _, Result};
use async_trait::async_trait;
use redb::ReadableTable as _;

use sluice_core::{SourceConfig, SourceStore};

use super::{RedbStore, SOURCES, open_read_table, storage};

#[async_trait]
impl SourceStore for RedbStore {
    async fn load_all(&self) -> Result<Vec<SourceConfig>> {
        let encoded = self
            .blocking(|database| {
                let read_txn = database.begin_read().map_err(storage)?;
                let Some(table) = open_read_table(&read_txn, SOURCES)? else {
                    return Ok(Vec::new());
                };
                let mut encoded = Vec::new();
                for entry in table.iter().map_err(storage)? {
                    let (_, config) = entry.map_err(storage)?;
                    encoded.push(config.value().to_string());
                }
                Ok(encoded)
            })
            .await?;

        encoded
            .iter()
            .map(|config| serde_json::from_str(config).context("Failed to decode source config"))
            .collect()
    }

    #[tracing::instrument(skip_all, fields(source_id = %config.source_id))]
    async fn put(&self, config: &SourceConfig) -> Result<()> {
        let source_id = config.source_id.clone();
        let encoded = serde_json::to_string(config)?;
        self.blocking(move |database| {
            let write_txn = database.begin_write().map_err(storage)?;
            {
                let mut table = write_txn.open_table(SOURCES).map_err(storage)?;
                table
                    .insert(source_id.as_str(), encoded.as_str())
                    .map_err(storage)?;
            }
            write_txn.commit().map_err(storage)
        })
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, source_id: &str) -> Result<bool> {
        let source_id = source_id.to_string();
        let removed = self
            .blocking(move |database| {
                let write_txn = database.begin_write().map_err(storage)?;
                let removed = {
                    let mut table = write_txn.open_table(SOURCES).map_err(storage)?;
                    table.remove(source_id.as_str()).map_err(storage)?.is_some()
                };
                write_txn.commit().map_err(storage)?;
                Ok(removed)
            })
            .await?;
        Ok(removed)
    }
}
