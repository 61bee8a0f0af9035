//! Node local append-only ingestion.
//!
//! Documents pushed through [`IngestQueues::append`] are buffered in memory until the pipeline of
//! the implicit ingest API source has committed them, at which point the queue is truncated.
//!
//! Every node owns one queue, exposed as the partition `ingest-api-queue/<node id>`. The ingest API
//! source runs one pipeline per node, so each queue is drained on the node that buffered it and
//! checkpoints of different nodes never collide.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;

use sluice_core::{
    Connector, ConnectorCapabilities, ConnectorFactory, FetchedBatch, PartitionId, Position,
    NodeId, RawRecord, SourceConfig, SourceType, errors::ConnectorError,
};

const QUEUE_PARTITION_PREFIX: &str = "ingest-api-queue";

#[derive(Debug, Default)]
struct Queue {
    last_position: u64,
    records: VecDeque<(u64, Vec<u8>)>,
}

/// The in-memory queue behind the ingest API source on one node. Clones share the queue.
#[derive(Debug, Clone)]
pub struct IngestQueues {
    partition_id: PartitionId,
    queue: Arc<Mutex<Queue>>,
}

impl IngestQueues {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            partition_id: PartitionId::from(format!(
                "{QUEUE_PARTITION_PREFIX}/{}",
                node_id.into()
            )),
            queue: Arc::default(),
        }
    }

    /// The partition this node's queue is read and checkpointed under.
    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    fn lock(&self) -> Result<MutexGuard<'_, Queue>, ConnectorError> {
        self.queue
            .lock()
            .map_err(|_| ConnectorError::unavailable(anyhow::anyhow!("ingest queue lock poisoned")))
    }

    /// Appends documents and returns the position of the last one.
    ///
    /// # Errors
    ///
    /// Fails only if the queue lock is poisoned.
    pub fn append<T: Into<Vec<u8>>>(
        &self,
        docs: impl IntoIterator<Item = T>,
    ) -> Result<Position, ConnectorError> {
        let mut queue = self.lock()?;
        for doc in docs {
            queue.last_position += 1;
            let position = queue.last_position;
            queue.records.push_back((position, doc.into()));
        }
        Ok(Position::from(queue.last_position))
    }

    /// Documents not yet truncated.
    pub fn len(&self) -> usize {
        self.lock().map_or(0, |queue| queue.records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, from: &Position, max_batch_size: usize) -> Result<Vec<RawRecord>, ConnectorError> {
        let from = match from {
            Position::Beginning => 0,
            Position::Eof => return Ok(Vec::new()),
            Position::Offset(_) => from.as_u64().ok_or_else(|| {
                ConnectorError::config(format!("`{from}` is not an ingest queue position"))
            })?,
        };
        let queue = self.lock()?;
        Ok(queue
            .records
            .iter()
            .filter(|(position, _)| *position > from)
            .take(max_batch_size)
            .map(|(position, payload)| {
                RawRecord::new(self.partition_id.clone(), *position, payload.clone())
            })
            .collect())
    }

    fn truncate(&self, up_to: &Position) -> Result<(), ConnectorError> {
        let Some(up_to) = up_to.as_u64() else {
            return Ok(());
        };
        let mut queue = self.lock()?;
        while queue
            .records
            .front()
            .is_some_and(|(position, _)| *position <= up_to)
        {
            queue.records.pop_front();
        }
        Ok(())
    }
}

/// Reads the [`IngestQueues`] of this node.
#[derive(Debug, Clone)]
pub struct IngestApiConnector {
    queues: IngestQueues,
}

impl IngestApiConnector {
    pub fn new(queues: IngestQueues) -> Self {
        Self { queues }
    }

    fn ensure_local(&self, partition_id: &PartitionId) -> Result<(), ConnectorError> {
        if partition_id == self.queues.partition_id() {
            Ok(())
        } else {
            Err(ConnectorError::config(format!(
                "ingest queue `{partition_id}` is not buffered on this node"
            )))
        }
    }
}

#[async_trait]
impl Connector for IngestApiConnector {
    async fn list_partitions(&self) -> Result<Vec<PartitionId>, ConnectorError> {
        Ok(vec![self.queues.partition_id().clone()])
    }

    async fn fetch(
        &self,
        partition_id: &PartitionId,
        from: &Position,
        max_batch_size: usize,
    ) -> Result<FetchedBatch, ConnectorError> {
        self.ensure_local(partition_id)?;
        let records = self.queues.read(from, max_batch_size)?;
        let end_of_partition = records.len() < max_batch_size;
        Ok(FetchedBatch::new(records).with_end_of_partition(end_of_partition))
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        SourceType::IngestApi.capabilities()
    }

    async fn suggest_truncate(
        &self,
        partition_id: &PartitionId,
        position: &Position,
    ) -> Result<(), ConnectorError> {
        self.ensure_local(partition_id)?;
        self.queues.truncate(position)
    }
}

#[derive(Debug, Clone)]
pub struct IngestApiConnectorFactory {
    queues: IngestQueues,
}

impl IngestApiConnectorFactory {
    pub fn new(queues: IngestQueues) -> Self {
        Self { queues }
    }
}

#[async_trait]
impl ConnectorFactory for IngestApiConnectorFactory {
    fn source_type(&self) -> SourceType {
        SourceType::IngestApi
    }

    async fn create(&self, _config: &SourceConfig) -> Result<Arc<dyn Connector>, ConnectorError> {
        Ok(Arc::new(IngestApiConnector::new(self.queues.clone())))
    }
}
