//! Kafka is a distributed streaming platform.
//!
//! This module provides a Kafka [`Connector`] reading the partitions of a single topic. Partition
//! ids are the Kafka partition numbers and positions are message offsets. Kafka sources can be
//! spread over several pipelines, each owning a subset of the partitions, and support backfill
//! mode by comparing offsets against the high watermark.
//!
//! The consumer is configured with the `client_params` of the source, passed verbatim to
//! librdkafka. Offsets are never committed to Kafka; progress is tracked by the checkpoint store.
//!
//! # Example
//!
//! ```no_run
//! # use sluice_core::{SourceConfig, SourceType};
//! let config = SourceConfig::builder()
//!     .source_id("clickstream")
//!     .source_type(SourceType::Kafka)
//!     .param("topic", "clicks")
//!     .param("client_params", serde_json::json!({"bootstrap.servers": "localhost:9092"}))
//!     .desired_num_pipelines(4)
//!     .build()
//!     .unwrap();
//! ```
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rdkafka::{
    Message as _, Offset, TopicPartitionList,
    consumer::{BaseConsumer, Consumer as _},
};
use serde_json::Value as JsonValue;

use sluice_core::{
    Connector, ConnectorCapabilities, ConnectorFactory, FetchedBatch, PartitionId, Position,
    RawRecord, SourceConfig, SourceType, errors::ConnectorError, source_params::KafkaSourceParams,
    source_params::SourceParams,
};

pub use rdkafka::config::ClientConfig;

const DEFAULT_GROUP_ID: &str = "sluice";
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Builds the librdkafka configuration from the source params.
///
/// Offsets are managed by the checkpoint store, so auto commit is always turned off.
pub fn client_config(params: &KafkaSourceParams) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in &params.client_params {
        let value = match value {
            JsonValue::String(value) => value.clone(),
            other => other.to_string(),
        };
        config.set(key, value);
    }
    if config.get("group.id").is_none() {
        config.set("group.id", DEFAULT_GROUP_ID);
    }
    config.set("enable.auto.commit", "false");
    config.set("enable.auto.offset.store", "false");
    config
}

/// Kafka offset to start consuming from so that only records after `from` are read.
fn start_offset(from: &Position) -> Result<Offset, ConnectorError> {
    match from {
        Position::Beginning => Ok(Offset::Beginning),
        Position::Eof => Ok(Offset::End),
        Position::Offset(_) => {
            let offset = from
                .as_u64()
                .and_then(|offset| i64::try_from(offset).ok())
                .ok_or_else(|| {
                    ConnectorError::config(format!("`{from}` is not a valid Kafka offset"))
                })?;
            Ok(Offset::Offset(offset + 1))
        }
    }
}

fn kafka_partition(partition_id: &PartitionId) -> Result<i32, ConnectorError> {
    partition_id.as_str().parse().map_err(|_| {
        ConnectorError::config(format!("`{partition_id}` is not a Kafka partition number"))
    })
}

#[derive(Clone)]
pub struct KafkaConnector {
    topic: String,
    consumer: Arc<BaseConsumer>,
}

impl std::fmt::Debug for KafkaConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConnector")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl KafkaConnector {
    /// # Errors
    ///
    /// Fails if librdkafka rejects the client configuration.
    pub fn try_new(params: &KafkaSourceParams) -> Result<Self, ConnectorError> {
        let consumer: BaseConsumer = client_config(params)
            .create()
            .map_err(|err| ConnectorError::config(format!("invalid Kafka client params: {err}")))?;
        Ok(Self {
            topic: params.topic.clone(),
            consumer: Arc::new(consumer),
        })
    }

    /// Runs a blocking librdkafka call off the async runtime.
    async fn blocking<T, F>(&self, operation: F) -> Result<T, ConnectorError>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer, &str) -> Result<T, ConnectorError> + Send + 'static,
    {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || operation(&consumer, &topic))
            .await
            .map_err(ConnectorError::unavailable)?
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    #[tracing::instrument(skip_all, fields(topic = %self.topic))]
    async fn list_partitions(&self) -> Result<Vec<PartitionId>, ConnectorError> {
        self.blocking(|consumer, topic| {
            let metadata = consumer
                .fetch_metadata(Some(topic), METADATA_TIMEOUT)
                .map_err(ConnectorError::unavailable)?;
            let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
                return Err(ConnectorError::unavailable(anyhow::anyhow!(
                    "topic `{topic}` not found"
                )));
            };
            if let Some(err) = topic_metadata.error() {
                return Err(ConnectorError::unavailable(anyhow::anyhow!(
                    "failed to fetch metadata of topic `{topic}`: {err:?}"
                )));
            }
            let mut partitions: Vec<i32> = topic_metadata
                .partitions()
                .iter()
                .map(rdkafka::metadata::MetadataPartition::id)
                .collect();
            partitions.sort_unstable();
            Ok(partitions
                .into_iter()
                .map(|partition| PartitionId::from(partition.to_string()))
                .collect())
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(topic = %self.topic, %partition_id, %from))]
    async fn fetch(
        &self,
        partition_id: &PartitionId,
        from: &Position,
        max_batch_size: usize,
    ) -> Result<FetchedBatch, ConnectorError> {
        let partition = kafka_partition(partition_id)?;
        let offset = start_offset(from)?;
        let partition_id = partition_id.clone();

        self.blocking(move |consumer, topic| {
            let (_, high_watermark) = consumer
                .fetch_watermarks(topic, partition, METADATA_TIMEOUT)
                .map_err(ConnectorError::unavailable)?;
            let next_offset = match offset {
                Offset::Offset(offset) => offset,
                Offset::End => high_watermark,
                _ => 0,
            };
            if next_offset >= high_watermark {
                return Ok(FetchedBatch::end_of_partition());
            }

            let mut assignment = TopicPartitionList::new();
            assignment
                .add_partition_offset(topic, partition, offset)
                .map_err(ConnectorError::unavailable)?;
            consumer
                .assign(&assignment)
                .map_err(ConnectorError::unavailable)?;

            let mut records = Vec::with_capacity(max_batch_size.min(1_024));
            let mut last_offset = None;
            while records.len() < max_batch_size {
                let Some(message) = consumer.poll(POLL_TIMEOUT) else {
                    break;
                };
                let message = message.map_err(ConnectorError::unavailable)?;
                if message.partition() != partition {
                    continue;
                }
                last_offset = Some(message.offset());
                records.push(RawRecord::new(
                    partition_id.clone(),
                    Position::from(message.offset()),
                    message.payload().unwrap_or_default(),
                ));
                if message.offset() + 1 >= high_watermark {
                    break;
                }
            }

            let end_of_partition =
                last_offset.is_some_and(|offset| offset + 1 >= high_watermark);
            tracing::trace!(num_records = records.len(), high_watermark, "fetched from kafka");
            Ok(FetchedBatch::new(records).with_end_of_partition(end_of_partition))
        })
        .await
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        SourceType::Kafka.capabilities()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaConnectorFactory;

#[async_trait]
impl ConnectorFactory for KafkaConnectorFactory {
    fn source_type(&self) -> SourceType {
        SourceType::Kafka
    }

    async fn create(&self, config: &SourceConfig) -> Result<Arc<dyn Connector>, ConnectorError> {
        let SourceParams::Kafka(params) = config
            .source_params()
            .map_err(|err| ConnectorError::config(err.to_string()))?
        else {
            return Err(ConnectorError::config(format!(
                "source `{}` is not a kafka source",
                config.source_id
            )));
        };
        Ok(Arc::new(KafkaConnector::try_new(&params)?))
    }
}
