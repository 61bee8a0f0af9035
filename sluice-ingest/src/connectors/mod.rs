//! Built-in connectors and the loader mapping source types to connector factories.
//!
//! Connectors backed by external client libraries live in `sluice-integrations` and are added to
//! a [`ConnectorLoader`] with [`ConnectorLoader::with_factory`].
use std::{collections::BTreeMap, sync::Arc};

use sluice_core::{
    Connector, ConnectorFactory, SourceConfig, SourceType, errors::ConnectorError,
};

mod file;
mod ingest_api;
mod vec;
mod void;

pub use file::{FileConnector, FileConnectorFactory};
pub use ingest_api::{IngestApiConnector, IngestApiConnectorFactory, IngestQueues};
pub use vec::{VecConnector, VecConnectorFactory};
pub use void::{VoidConnector, VoidConnectorFactory};

/// Registry of connector factories, one per source type.
#[derive(Debug, Clone, Default)]
pub struct ConnectorLoader {
    factories: BTreeMap<SourceType, Arc<dyn ConnectorFactory>>,
}

impl ConnectorLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// A loader with every connector of this crate. `queues` backs the ingest API source.
    pub fn with_builtin_connectors(queues: IngestQueues) -> Self {
        Self::new()
            .with_factory(FileConnectorFactory)
            .with_factory(IngestApiConnectorFactory::new(queues))
            .with_factory(VecConnectorFactory)
            .with_factory(VoidConnectorFactory)
    }

    /// Registers `factory` for its source type, replacing any previous one.
    #[must_use]
    pub fn with_factory(mut self, factory: impl ConnectorFactory + 'static) -> Self {
        self.factories
            .insert(factory.source_type(), Arc::new(factory));
        self
    }

    pub fn supported_types(&self) -> Vec<SourceType> {
        self.factories.keys().copied().collect()
    }

    /// Instantiates the connector of a source.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectorError::Config`] if the params are invalid or no connector is
    /// registered for the source type.
    pub async fn load(&self, config: &SourceConfig) -> Result<Arc<dyn Connector>, ConnectorError> {
        config
            .source_params()
            .map_err(|err| ConnectorError::config(err.to_string()))?;
        let Some(factory) = self.factories.get(&config.source_type) else {
            return Err(ConnectorError::config(format!(
                "source type `{}` is not supported by this build, enable the matching feature",
                config.source_type
            )));
        };
        factory.create(config).await
    }

    /// Instantiates the connector and lists its partitions.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectorLoader::load`], or the error of the connectivity check itself.
    #[tracing::instrument(skip_all, fields(source_id = %config.source_id))]
    pub async fn check_connectivity(&self, config: &SourceConfig) -> Result<(), ConnectorError> {
        let connector = self.load(config).await?;
        connector.check_connectivity().await?;
        tracing::debug!("connectivity check passed");
        Ok(())
    }
}
