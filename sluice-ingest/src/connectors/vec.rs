use std::sync::Arc;

use async_trait::async_trait;

use sluice_core::{
    Connector, ConnectorCapabilities, ConnectorFactory, FetchedBatch, PartitionId, Position,
    RawRecord, SourceConfig, SourceType, errors::ConnectorError, source_params::SourceParams,
    source_params::VecSourceParams,
};

const DEFAULT_PARTITION: &str = "vec";

/// Serves the documents listed in its params, in order, from a single partition.
///
/// The position of the n-th document is `n`, counting from one.
#[derive(Debug, Clone)]
pub struct VecConnector {
    partition_id: PartitionId,
    docs: Arc<[String]>,
    batch_num_docs: usize,
}

impl VecConnector {
    pub fn new(params: VecSourceParams) -> Self {
        let partition_id = if params.partition.is_empty() {
            PartitionId::from(DEFAULT_PARTITION)
        } else {
            PartitionId::from(params.partition)
        };
        Self {
            partition_id,
            docs: params.docs.into(),
            batch_num_docs: params.batch_num_docs.max(1),
        }
    }
}

#[async_trait]
impl Connector for VecConnector {
    async fn list_partitions(&self) -> Result<Vec<PartitionId>, ConnectorError> {
        Ok(vec![self.partition_id.clone()])
    }

    async fn fetch(
        &self,
        partition_id: &PartitionId,
        from: &Position,
        max_batch_size: usize,
    ) -> Result<FetchedBatch, ConnectorError> {
        if partition_id != &self.partition_id {
            return Ok(FetchedBatch::end_of_partition());
        }
        let start = match from {
            Position::Beginning => 0,
            Position::Eof => self.docs.len(),
            Position::Offset(_) => from
                .as_u64()
                .and_then(|offset| usize::try_from(offset).ok())
                .ok_or_else(|| {
                    ConnectorError::config(format!("`{from}` is not a vec source position"))
                })?,
        };
        let limit = max_batch_size.min(self.batch_num_docs);
        let records: Vec<RawRecord> = self
            .docs
            .iter()
            .enumerate()
            .skip(start)
            .take(limit)
            .map(|(idx, doc)| {
                RawRecord::new(
                    self.partition_id.clone(),
                    idx as u64 + 1,
                    doc.as_bytes().to_vec(),
                )
            })
            .collect();
        let end_of_partition = start + records.len() >= self.docs.len();
        Ok(FetchedBatch::new(records).with_end_of_partition(end_of_partition))
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        SourceType::Vec.capabilities()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VecConnectorFactory;

#[async_trait]
impl ConnectorFactory for VecConnectorFactory {
    fn source_type(&self) -> SourceType {
        SourceType::Vec
    }

    async fn create(&self, config: &SourceConfig) -> Result<Arc<dyn Connector>, ConnectorError> {
        match config.source_params() {
            Ok(SourceParams::Vec(params)) => Ok(Arc::new(VecConnector::new(params))),
            Ok(_) => Err(ConnectorError::config("expected vec source params")),
            Err(err) => Err(ConnectorError::config(err.to_string())),
        }
    }
}
