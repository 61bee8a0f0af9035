use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use sluice_core::{SourceConfig, SourceId, SourceStore};

/// Source configurations kept in memory. Clones share their state.
#[derive(Debug, Default, Clone)]
pub struct MemorySourceStore {
    configs: Arc<RwLock<BTreeMap<SourceId, SourceConfig>>>,
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn load_all(&self) -> Result<Vec<SourceConfig>> {
        Ok(self.configs.read().await.values().cloned().collect())
    }

    async fn put(&self, config: &SourceConfig) -> Result<()> {
        self.configs
            .write()
            .await
            .insert(config.source_id.clone(), config.clone());
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<bool> {
        Ok(self.configs.write().await.remove(source_id).is_some())
    }
}
