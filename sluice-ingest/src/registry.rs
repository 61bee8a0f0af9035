//! The set of configured sources, the single source of truth for what should run.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tokio::sync::{Mutex, RwLock, watch};

use sluice_core::{
    CheckpointStore, INGEST_API_SOURCE_ID, SourceConfig, SourceId, SourceIncarnation,
    SourceStore, SourceType, errors::RegistryError,
};

/// Configured sources of an index.
///
/// Mutations are validated, written through to the [`SourceStore`] and then published by bumping
/// a version observers can [`subscribe`](SourceRegistry::subscribe) to. The implicit ingest API
/// source always exists, is always enabled and cannot be deleted.
///
/// Only source types the node's connectors can run are accepted, so a source is never stored
/// that no pipeline could ever load.
#[derive(Debug)]
pub struct SourceRegistry {
    sources: RwLock<BTreeMap<SourceId, SourceConfig>>,
    supported_types: BTreeSet<SourceType>,
    store: Arc<dyn SourceStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    // Serializes mutations so the store and the in-memory view never diverge.
    mutation: Mutex<()>,
    version: watch::Sender<u64>,
}

impl SourceRegistry {
    /// Loads the registry from `store`, adding the implicit ingest API source if missing.
    ///
    /// `supported_types` are the source types new sources may use, usually
    /// [`ConnectorLoader::supported_types`](crate::connectors::ConnectorLoader::supported_types).
    ///
    /// # Errors
    ///
    /// Fails if the stores cannot be read or written.
    #[tracing::instrument(skip_all)]
    pub async fn open(
        store: Arc<dyn SourceStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        supported_types: impl IntoIterator<Item = SourceType>,
    ) -> Result<Self, RegistryError> {
        let supported_types: BTreeSet<SourceType> = supported_types.into_iter().collect();
        let mut sources: BTreeMap<SourceId, SourceConfig> = store
            .load_all()
            .await
            .map_err(RegistryError::Storage)?
            .into_iter()
            .map(|config| (config.source_id.clone(), config))
            .collect();

        let implicit_needs_write = sources
            .get(INGEST_API_SOURCE_ID)
            .is_none_or(|config| !config.enabled);
        if implicit_needs_write {
            let implicit = SourceConfig::ingest_api_default();
            store.put(&implicit).await.map_err(RegistryError::Storage)?;
            sources.insert(implicit.source_id.clone(), implicit);
        }

        for (source_id, config) in &sources {
            if !supported_types.contains(&config.source_type) {
                tracing::warn!(
                    %source_id,
                    source_type = %config.source_type,
                    "stored source has a type this build cannot run"
                );
            }
            checkpoints
                .init_source(source_id, config.incarnation)
                .await?;
        }

        tracing::info!(num_sources = sources.len(), "source registry loaded");

        let (version, _) = watch::channel(0);
        Ok(Self {
            sources: RwLock::new(sources),
            supported_types,
            store,
            checkpoints,
            mutation: Mutex::new(()),
            version,
        })
    }

    /// Validates and adds a source under a fresh [`SourceIncarnation`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidConfig`] listing every violated constraint,
    /// [`RegistryError::UnsupportedSourceType`] if no connector can run it, or
    /// [`RegistryError::AlreadyExists`] if the id is taken. Nothing is written in any case.
    #[tracing::instrument(skip_all, fields(source_id = %config.source_id))]
    pub async fn create(&self, mut config: SourceConfig) -> Result<SourceId, RegistryError> {
        config.validate()?;
        if config.is_implicit() {
            return Err(RegistryError::AlreadyExists(config.source_id));
        }
        if !self.supported_types.contains(&config.source_type) {
            return Err(RegistryError::UnsupportedSourceType(config.source_type));
        }
        config.incarnation = SourceIncarnation::generate();

        let _guard = self.mutation.lock().await;
        if self.sources.read().await.contains_key(&config.source_id) {
            return Err(RegistryError::AlreadyExists(config.source_id));
        }

        self.checkpoints
            .init_source(&config.source_id, config.incarnation)
            .await?;
        self.store
            .put(&config)
            .await
            .map_err(RegistryError::Storage)?;

        let source_id = config.source_id.clone();
        tracing::info!(
            source_type = %config.source_type,
            enabled = config.enabled,
            incarnation = %config.incarnation,
            "source created"
        );
        self.sources.write().await.insert(source_id.clone(), config);
        self.bump_version();
        Ok(source_id)
    }

    /// # Errors
    ///
    /// Fails if the source does not exist or cannot be persisted.
    pub async fn enable(&self, source_id: &str) -> Result<(), RegistryError> {
        self.toggle(source_id, true).await
    }

    /// Disables a source. Its pipelines are stopped on the next rebalance, its checkpoints stay.
    ///
    /// # Errors
    ///
    /// Fails if the source does not exist, is the implicit ingest API source, or cannot be
    /// persisted.
    pub async fn disable(&self, source_id: &str) -> Result<(), RegistryError> {
        if source_id == INGEST_API_SOURCE_ID {
            return Err(RegistryError::AlwaysEnabled(source_id.to_string()));
        }
        self.toggle(source_id, false).await
    }

    #[tracing::instrument(skip(self))]
    async fn toggle(&self, source_id: &str, enabled: bool) -> Result<(), RegistryError> {
        let _guard = self.mutation.lock().await;
        let mut config = self
            .get(source_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(source_id.to_string()))?;
        if config.enabled == enabled {
            return Ok(());
        }

        config.enabled = enabled;
        self.store
            .put(&config)
            .await
            .map_err(RegistryError::Storage)?;
        self.sources
            .write()
            .await
            .insert(source_id.to_string(), config);

        tracing::info!(enabled, "source toggled");
        self.bump_version();
        Ok(())
    }

    /// Removes a source and all of its checkpoints.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::Undeletable`] for the implicit ingest API source and with
    /// [`RegistryError::NotFound`] for unknown sources.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, source_id: &str) -> Result<(), RegistryError> {
        if source_id == INGEST_API_SOURCE_ID {
            return Err(RegistryError::Undeletable(source_id.to_string()));
        }

        let _guard = self.mutation.lock().await;
        if !self.sources.read().await.contains_key(source_id) {
            return Err(RegistryError::NotFound(source_id.to_string()));
        }

        self.store
            .delete(source_id)
            .await
            .map_err(RegistryError::Storage)?;
        self.sources.write().await.remove(source_id);
        self.bump_version();

        // The config is gone at this point; a cleanup failure must still be reported so the
        // operator can retry, since leftover checkpoints would be picked up by a new source with
        // the same id.
        if let Err(err) = self.checkpoints.delete_source(source_id).await {
            tracing::error!(error = %err, "failed to delete checkpoints of deleted source");
            return Err(err.into());
        }

        tracing::info!("source deleted");
        Ok(())
    }

    pub async fn get(&self, source_id: &str) -> Option<SourceConfig> {
        self.sources.read().await.get(source_id).cloned()
    }

    /// All sources, ordered by id.
    pub async fn list(&self) -> Vec<SourceConfig> {
        self.sources.read().await.values().cloned().collect()
    }

    /// Enabled sources, ordered by id.
    pub async fn enabled_sources(&self) -> Vec<SourceConfig> {
        self.sources
            .read()
            .await
            .values()
            .filter(|config| config.enabled)
            .cloned()
            .collect()
    }

    /// Incremented on every effective change.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump_version(&self) {
        self.version.send_modify(|version| *version += 1);
    }
}
