use std::sync::Arc;

use async_trait::async_trait;

use sluice_core::{
    Connector, ConnectorCapabilities, ConnectorFactory, FetchedBatch, PartitionId, Position,
    SourceConfig, SourceType, errors::ConnectorError,
};

const VOID_PARTITION: &str = "void";

/// Has a single partition that is always at its end.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoidConnector;

#[async_trait]
impl Connector for VoidConnector {
    async fn list_partitions(&self) -> Result<Vec<PartitionId>, ConnectorError> {
        Ok(vec![PartitionId::from(VOID_PARTITION)])
    }

    async fn fetch(
        &self,
        _partition_id: &PartitionId,
        _from: &Position,
        _max_batch_size: usize,
    ) -> Result<FetchedBatch, ConnectorError> {
        Ok(FetchedBatch::end_of_partition())
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        SourceType::Void.capabilities()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VoidConnectorFactory;

#[async_trait]
impl ConnectorFactory for VoidConnectorFactory {
    fn source_type(&self) -> SourceType {
        SourceType::Void
    }

    async fn create(&self, _config: &SourceConfig) -> Result<Arc<dyn Connector>, ConnectorError> {
        Ok(Arc::new(VoidConnector))
    }
}
