//! Amazon Kinesis Data Streams.
//!
//! Each shard of the stream is a partition and positions are sequence numbers. A stream is read by
//! a single pipeline. With backfill mode enabled the pipeline drains once every shard reports that
//! it is caught up with the tip of the stream.
//!
//! By default the aws sdk is configured from the environment. The `region` or, for local setups
//! such as localstack, the `endpoint` param overrides it; setting both is rejected by validation.
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_kinesis::{Client, error::SdkError, types::ShardIteratorType};

use sluice_core::{
    Connector, ConnectorCapabilities, ConnectorFactory, FetchedBatch, PartitionId, Position,
    RawRecord, SourceConfig, SourceType, errors::ConnectorError,
    source_params::{KinesisSourceParams, SourceParams},
};

#[cfg(test)]
use mockall::automock;

/// Hard limit of a single `GetRecords` call
const MAX_RECORDS_PER_CALL: usize = 10_000;

/// Records returned by one `GetRecords` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardRecords {
    /// `(sequence number, data)` in shard order
    pub records: Vec<(String, Vec<u8>)>,
    pub millis_behind_latest: Option<i64>,
    /// The shard was closed by a reshard and everything has been read
    pub closed: bool,
}

#[cfg_attr(test, automock)]
#[async_trait]
trait KinesisApi: std::fmt::Debug + Send + Sync {
    async fn list_shards(&self, stream_name: &str) -> anyhow::Result<Vec<String>>;

    async fn get_records(
        &self,
        stream_name: &str,
        shard_id: &str,
        after: Option<String>,
        limit: usize,
    ) -> anyhow::Result<ShardRecords>;
}

#[async_trait]
impl KinesisApi for Client {
    async fn list_shards(&self, stream_name: &str) -> anyhow::Result<Vec<String>> {
        let mut shard_ids = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            // The stream name and a continuation token are mutually exclusive.
            let request = match next_token.take() {
                Some(token) => self.list_shards().next_token(token),
                None => self.list_shards().stream_name(stream_name),
            };
            let response = request.send().await.map_err(SdkError::into_service_error)?;
            shard_ids.extend(
                response
                    .shards()
                    .iter()
                    .map(|shard| shard.shard_id().to_string()),
            );
            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => return Ok(shard_ids),
            }
        }
    }

    async fn get_records(
        &self,
        stream_name: &str,
        shard_id: &str,
        after: Option<String>,
        limit: usize,
    ) -> anyhow::Result<ShardRecords> {
        let iterator = self
            .get_shard_iterator()
            .stream_name(stream_name)
            .shard_id(shard_id);
        let iterator = match after {
            Some(sequence_number) => iterator
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(sequence_number),
            None => iterator.shard_iterator_type(ShardIteratorType::TrimHorizon),
        };
        let response = iterator
            .send()
            .await
            .map_err(SdkError::into_service_error)?;
        let Some(shard_iterator) = response.shard_iterator().map(str::to_string) else {
            return Ok(ShardRecords {
                closed: true,
                ..ShardRecords::default()
            });
        };

        let response = self
            .get_records()
            .shard_iterator(shard_iterator)
            .limit(i32::try_from(limit.min(MAX_RECORDS_PER_CALL)).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(SdkError::into_service_error)?;

        Ok(ShardRecords {
            records: response
                .records()
                .iter()
                .map(|record| {
                    (
                        record.sequence_number().to_string(),
                        record.data().as_ref().to_vec(),
                    )
                })
                .collect(),
            millis_behind_latest: response.millis_behind_latest(),
            closed: response.next_shard_iterator().is_none(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct KinesisConnector {
    stream_name: String,
    client: Arc<dyn KinesisApi>,
}

impl KinesisConnector {
    /// Builds a client from the environment, overridden by the region or endpoint of `params`.
    pub async fn from_params(params: &KinesisSourceParams) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &params.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &params.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        Self {
            stream_name: params.stream_name.clone(),
            client: Arc::new(Client::new(&sdk_config)),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }
}

#[async_trait]
impl Connector for KinesisConnector {
    #[tracing::instrument(skip_all, fields(stream_name = %self.stream_name))]
    async fn list_partitions(&self) -> Result<Vec<PartitionId>, ConnectorError> {
        let mut shard_ids = self
            .client
            .list_shards(&self.stream_name)
            .await
            .map_err(ConnectorError::unavailable)?;
        shard_ids.sort();
        Ok(shard_ids.into_iter().map(PartitionId::from).collect())
    }

    #[tracing::instrument(skip_all, fields(stream_name = %self.stream_name, %partition_id, %from))]
    async fn fetch(
        &self,
        partition_id: &PartitionId,
        from: &Position,
        max_batch_size: usize,
    ) -> Result<FetchedBatch, ConnectorError> {
        let after = match from {
            Position::Beginning => None,
            Position::Offset(sequence_number) => Some(sequence_number.clone()),
            Position::Eof => return Ok(FetchedBatch::end_of_partition()),
        };
        let shard = self
            .client
            .get_records(&self.stream_name, partition_id.as_str(), after, max_batch_size)
            .await
            .map_err(ConnectorError::unavailable)?;

        let end_of_partition = shard.closed || shard.millis_behind_latest == Some(0);
        let records = shard
            .records
            .into_iter()
            .map(|(sequence_number, data)| {
                RawRecord::new(partition_id.clone(), Position::offset(sequence_number), data)
            })
            .collect();
        Ok(FetchedBatch::new(records).with_end_of_partition(end_of_partition))
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        SourceType::Kinesis.capabilities()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KinesisConnectorFactory;

#[async_trait]
impl ConnectorFactory for KinesisConnectorFactory {
    fn source_type(&self) -> SourceType {
        SourceType::Kinesis
    }

    async fn create(&self, config: &SourceConfig) -> Result<Arc<dyn Connector>, ConnectorError> {
        let SourceParams::Kinesis(params) = config
            .source_params()
            .map_err(|err| ConnectorError::config(err.to_string()))?
        else {
            return Err(ConnectorError::config(format!(
                "source `{}` is not a kinesis source",
                config.source_id
            )));
        };
        Ok(Arc::new(KinesisConnector::from_params(&params).await))
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    use super::*;

    fn connector(client: MockKinesisApi) -> KinesisConnector {
        KinesisConnector {
            stream_name: "events".to_string(),
            client: Arc::new(client),
        }
    }

    #[tokio::test]
    async fn test_shards_are_partitions() {
        let mut client = MockKinesisApi::new();
        client
            .expect_list_shards()
            .with(eq("events"))
            .returning(|_| {
                Ok(vec![
                    "shardId-000000000001".to_string(),
                    "shardId-000000000000".to_string(),
                ])
            });

        let partitions = connector(client).list_partitions().await.unwrap();
        assert_eq!(
            partitions,
            vec![
                PartitionId::from("shardId-000000000000"),
                PartitionId::from("shardId-000000000001")
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_resumes_after_sequence_number() {
        let mut client = MockKinesisApi::new();
        client
            .expect_get_records()
            .withf(|stream, shard, after, limit| {
                stream == "events"
                    && shard == "shardId-000000000000"
                    && after.as_deref() == Some("49590338271490256608559692538361571095921575989136588898")
                    && *limit == 100
            })
            .returning(|_, _, _, _| {
                Ok(ShardRecords {
                    records: vec![(
                        "49590338271490256608559692540925702759324208523137515618".to_string(),
                        b"{}".to_vec(),
                    )],
                    millis_behind_latest: Some(0),
                    closed: false,
                })
            });

        let batch = connector(client)
            .fetch(
                &"shardId-000000000000".into(),
                &Position::offset("49590338271490256608559692538361571095921575989136588898"),
                100,
            )
            .await
            .unwrap();

        assert_eq!(batch.records.len(), 1);
        assert!(batch.end_of_partition);
        assert!(
            batch.last_position().unwrap()
                > &Position::offset("49590338271490256608559692538361571095921575989136588898")
        );
    }

    #[tokio::test]
    async fn test_lagging_shard_is_not_at_end() {
        let mut client = MockKinesisApi::new();
        client
            .expect_get_records()
            .withf(|_, _, after, _| after.is_none())
            .returning(|_, _, _, _| {
                Ok(ShardRecords {
                    records: Vec::new(),
                    millis_behind_latest: Some(3_000),
                    closed: false,
                })
            });

        let batch = connector(client)
            .fetch(&"shardId-000000000000".into(), &Position::Beginning, 100)
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert!(!batch.end_of_partition);
    }

    #[tokio::test]
    async fn test_api_failures_are_transient() {
        let mut client = MockKinesisApi::new();
        client
            .expect_list_shards()
            .returning(|_| Err(anyhow::anyhow!("throttled")));

        let err = connector(client).list_partitions().await.unwrap_err();
        assert!(err.is_transient());
    }
}
