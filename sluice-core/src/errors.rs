//! Error taxonomy shared by every sluice crate.
use std::fmt;

use itertools::Itertools as _;
use thiserror::Error;

use crate::{SourceId, SourceType, checkpoint::PartitionId, checkpoint::Position};

/// A source configuration was rejected. Carries every violated constraint, not just the first.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct InvalidConfigError {
    pub violations: Vec<String>,
}

impl InvalidConfigError {
    pub fn new(violations: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            violations: violations.into_iter().map(Into::into).collect(),
        }
    }

    pub fn single(violation: impl Into<String>) -> Self {
        Self {
            violations: vec![violation.into()],
        }
    }
}

impl fmt::Display for InvalidConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid source config: {}",
            self.violations.iter().join("; ")
        )
    }
}

#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Transient connectivity problem, retried by the supervisor.
    #[error("connector unavailable: {0:#}")]
    Unavailable(anyhow::Error),

    /// Malformed or unsupported parameters. Fatal: the pipeline never starts.
    #[error("invalid connector configuration: {0}")]
    Config(String),
}

impl ConnectorError {
    pub fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        ConnectorError::Unavailable(err.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ConnectorError::Config(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Unavailable(_))
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The supplied position does not move the partition forward.
    #[error(
        "stale checkpoint for `{source_id}/{partition_id}`: stored position is {current}, attempted {attempted}"
    )]
    Stale {
        source_id: SourceId,
        partition_id: PartitionId,
        current: Position,
        attempted: Position,
    },

    /// The source was deleted, or was never initialized in this store.
    #[error("source `{0}` no longer exists")]
    SourceGone(SourceId),

    #[error("checkpoint storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl CheckpointError {
    pub fn is_stale(&self) -> bool {
        matches!(self, CheckpointError::Stale { .. })
    }

    pub fn is_source_gone(&self) -> bool {
        matches!(self, CheckpointError::SourceGone(_))
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidConfig(#[from] InvalidConfigError),

    #[error("source `{0}` already exists")]
    AlreadyExists(SourceId),

    #[error("source type `{0}` is not supported by this build, enable the matching feature")]
    UnsupportedSourceType(SourceType),

    #[error("source `{0}` does not exist")]
    NotFound(SourceId),

    #[error("source `{0}` cannot be deleted")]
    Undeletable(SourceId),

    #[error("source `{0}` cannot be disabled")]
    AlwaysEnabled(SourceId),

    #[error("failed to clean up checkpoints: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("source store failure: {0:#}")]
    Storage(anyhow::Error),
}

/// Why an ingestion pipeline terminated abnormally.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("transform failed: {0:#}")]
    Transform(anyhow::Error),

    #[error("failed to write documents: {0:#}")]
    Sink(anyhow::Error),
}

impl PipelineError {
    /// Fatal errors are not retried by the supervisor.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Connector(ConnectorError::Config(_)))
    }
}
