#![allow(clippy::missing_panics_doc)]
//! Fakes shared by the tests of the sluice crates.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
    SourceConfig,
    checkpoint::{PartitionId, Position},
    connector::{Connector, ConnectorCapabilities, ConnectorFactory, FetchedBatch, RawRecord},
    errors::ConnectorError,
    source_config::SourceType,
};

#[derive(Debug, Default)]
struct ScriptedState {
    partitions: BTreeMap<PartitionId, Vec<RawRecord>>,
    failing_fetches: usize,
    fetches: usize,
    truncations: Vec<(PartitionId, Position)>,
}

/// In-memory connector whose content and failures are driven by the test.
///
/// Records of a partition get positions `1..=n` in insertion order. Clones share state, so a test
/// can keep a handle while a pipeline reads from it.
#[derive(Debug, Clone)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ScriptedState>>,
    capabilities: ConnectorCapabilities,
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new(ConnectorCapabilities {
            supports_distribution: true,
            supports_backfill_mode: true,
        })
    }
}

impl ScriptedConnector {
    pub fn new(capabilities: ConnectorCapabilities) -> Self {
        Self {
            state: Arc::default(),
            capabilities,
        }
    }

    #[must_use]
    pub fn with_partition<T: Into<Vec<u8>>>(
        self,
        partition_id: impl Into<PartitionId>,
        payloads: impl IntoIterator<Item = T>,
    ) -> Self {
        let partition_id = partition_id.into();
        self.state
            .lock()
            .unwrap()
            .partitions
            .entry(partition_id.clone())
            .or_default();
        for payload in payloads {
            self.append(partition_id.clone(), payload);
        }
        self
    }

    /// Appends a record and returns its position.
    pub fn append(
        &self,
        partition_id: impl Into<PartitionId>,
        payload: impl Into<Vec<u8>>,
    ) -> Position {
        let partition_id = partition_id.into();
        let mut state = self.state.lock().unwrap();
        let records = state.partitions.entry(partition_id.clone()).or_default();
        let position = Position::from(records.len() as u64 + 1);
        records.push(RawRecord::new(partition_id, position.clone(), payload));
        position
    }

    /// The next `count` fetches fail with a transient error.
    pub fn fail_next_fetches(&self, count: usize) {
        self.state.lock().unwrap().failing_fetches = count;
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    pub fn truncations(&self) -> Vec<(PartitionId, Position)> {
        self.state.lock().unwrap().truncations.clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn list_partitions(&self) -> Result<Vec<PartitionId>, ConnectorError> {
        Ok(self.state.lock().unwrap().partitions.keys().cloned().collect())
    }

    async fn fetch(
        &self,
        partition_id: &PartitionId,
        from: &Position,
        max_batch_size: usize,
    ) -> Result<FetchedBatch, ConnectorError> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(ConnectorError::unavailable(anyhow::anyhow!(
                "scripted fetch failure"
            )));
        }
        let Some(records) = state.partitions.get(partition_id) else {
            return Err(ConnectorError::unavailable(anyhow::anyhow!(
                "partition `{partition_id}` disappeared"
            )));
        };
        let pending: Vec<RawRecord> = records
            .iter()
            .filter(|record| &record.position > from)
            .cloned()
            .collect();
        let end_of_partition = pending.len() <= max_batch_size;
        let records = pending.into_iter().take(max_batch_size).collect();
        Ok(FetchedBatch::new(records).with_end_of_partition(end_of_partition))
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        self.capabilities
    }

    async fn suggest_truncate(
        &self,
        partition_id: &PartitionId,
        position: &Position,
    ) -> Result<(), ConnectorError> {
        self.state
            .lock()
            .unwrap()
            .truncations
            .push((partition_id.clone(), position.clone()));
        Ok(())
    }
}

/// Hands out clones of the same [`ScriptedConnector`] for a source type.
#[derive(Debug, Clone)]
pub struct ScriptedConnectorFactory {
    source_type: SourceType,
    connector: ScriptedConnector,
}

impl ScriptedConnectorFactory {
    pub fn new(source_type: SourceType, connector: ScriptedConnector) -> Self {
        Self {
            source_type,
            connector,
        }
    }
}

#[async_trait]
impl ConnectorFactory for ScriptedConnectorFactory {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    async fn create(&self, _config: &SourceConfig) -> Result<Arc<dyn Connector>, ConnectorError> {
        Ok(Arc::new(self.connector.clone()))
    }
}

/// A valid, enabled config for a distributable source.
pub fn void_source(
    source_id: &str,
    desired_num_pipelines: usize,
    max_num_pipelines_per_indexer: usize,
) -> SourceConfig {
    SourceConfig::builder()
        .source_id(source_id)
        .source_type(SourceType::Void)
        .desired_num_pipelines(desired_num_pipelines)
        .max_num_pipelines_per_indexer(max_num_pipelines_per_indexer)
        .build()
        .unwrap()
}

/// A valid, enabled config for a non-distributable source.
pub fn file_source(source_id: &str) -> SourceConfig {
    SourceConfig::builder()
        .source_id(source_id)
        .source_type(SourceType::File)
        .param("filepath", format!("{source_id}.json"))
        .build()
        .unwrap()
}
