//! The uniform protocol every source kind is adapted to.
//!
//! A [`Connector`] hides the client library of a source behind three questions: which partitions
//! exist, what comes after a given position in a partition, and what the source is capable of.
//! Connectors are created per pipeline by a [`ConnectorFactory`] registered for a [`SourceType`].
use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

use crate::{
    checkpoint::{PartitionId, Position},
    errors::ConnectorError,
    source_config::{SourceConfig, SourceType},
};

#[cfg(feature = "test-utils")]
#[doc(hidden)]
use mockall::automock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConnectorCapabilities {
    /// Partitions can be spread over several concurrent pipelines.
    pub supports_distribution: bool,
    /// The connector can tell when it reached the end of currently available data.
    pub supports_backfill_mode: bool,
}

/// A record as read from the source, paired with the position reached after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub partition_id: PartitionId,
    pub position: Position,
    pub payload: Vec<u8>,
}

impl RawRecord {
    pub fn new(
        partition_id: impl Into<PartitionId>,
        position: impl Into<Position>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            position: position.into(),
            payload: payload.into(),
        }
    }
}

/// Result of a single fetch on one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedBatch {
    /// Ordered by position.
    pub records: Vec<RawRecord>,
    /// Set when no record exists past the last one returned, at the time of the fetch.
    pub end_of_partition: bool,
}

impl FetchedBatch {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            end_of_partition: false,
        }
    }

    pub fn end_of_partition() -> Self {
        Self {
            records: Vec::new(),
            end_of_partition: true,
        }
    }

    #[must_use]
    pub fn with_end_of_partition(mut self, end_of_partition: bool) -> Self {
        self.end_of_partition = end_of_partition;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Position reached after the last record, if any.
    pub fn last_position(&self) -> Option<&Position> {
        self.records.last().map(|record| &record.position)
    }
}

#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
/// Reads records out of a source
pub trait Connector: Send + Sync + Debug {
    /// Currently existing partitions. The set may change over the lifetime of a source.
    async fn list_partitions(&self) -> Result<Vec<PartitionId>, ConnectorError>;

    /// Fetches up to `max_batch_size` records strictly after `from`.
    async fn fetch(
        &self,
        partition_id: &PartitionId,
        from: &Position,
        max_batch_size: usize,
    ) -> Result<FetchedBatch, ConnectorError>;

    fn capabilities(&self) -> ConnectorCapabilities;

    async fn check_connectivity(&self) -> Result<(), ConnectorError> {
        self.list_partitions().await.map(|_| ())
    }

    /// Informs the source that everything up to `position` is durably recorded and may be
    /// released. Advisory only.
    async fn suggest_truncate(
        &self,
        _partition_id: &PartitionId,
        _position: &Position,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }
}

#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
/// Builds connectors of one source type
pub trait ConnectorFactory: Send + Sync + Debug {
    fn source_type(&self) -> SourceType;

    /// Instantiates a connector for `config`.
    ///
    /// Fails with [`ConnectorError::Config`] when the params cannot be used, or with
    /// [`ConnectorError::Unavailable`] when the client cannot be set up right now.
    async fn create(&self, config: &SourceConfig) -> Result<Arc<dyn Connector>, ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_position() {
        let batch = FetchedBatch::new(vec![
            RawRecord::new("0", 1_u64, "a"),
            RawRecord::new("0", 2_u64, "b"),
        ]);
        assert_eq!(batch.last_position(), Some(&Position::from(2_u64)));
        assert!(!batch.end_of_partition);
        assert!(FetchedBatch::end_of_partition().is_empty());
    }

    #[derive(Debug)]
    struct Misconfigured;

    #[async_trait]
    impl Connector for Misconfigured {
        async fn list_partitions(&self) -> Result<Vec<PartitionId>, ConnectorError> {
            Err(ConnectorError::config("missing topic"))
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
            ConnectorCapabilities::default()
        }
    }

    #[tokio::test]
    async fn test_default_connectivity_check_lists_partitions() {
        let err = Misconfigured.check_connectivity().await.unwrap_err();
        assert!(!err.is_transient());
        assert!(
            Misconfigured
                .suggest_truncate(&PartitionId::from("0"), &Position::Eof)
                .await
                .is_ok()
        );
    }
}
