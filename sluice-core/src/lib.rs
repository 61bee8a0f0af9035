#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Core data model and traits of sluice.
//!
//! Everything that is shared between the allocator, the supervisors and the connectors lives
//! here: source configurations, partitions and positions, the capability traits and the error
//! taxonomy.

pub mod checkpoint;
pub mod connector;
mod document;
pub mod errors;
pub mod ingest_traits;
mod retry;
pub mod source_config;
pub mod source_params;
pub mod type_aliases;

pub use type_aliases::*;

/// All traits are available from the root
pub use crate::checkpoint::CheckpointStore;
pub use crate::connector::{Connector, ConnectorFactory};
pub use crate::ingest_traits::*;

pub use crate::checkpoint::{PartitionId, Position, SourceCheckpoint};
pub use crate::connector::{ConnectorCapabilities, FetchedBatch, RawRecord};
pub use crate::document::{Document, PLAIN_TEXT_FIELD};
pub use crate::retry::{RetryParams, RetryParamsBuilder};
pub use crate::source_config::{
    INGEST_API_SOURCE_ID, InputFormat, SourceConfig, SourceConfigBuilder, SourceIncarnation,
    SourceType, TransformConfig,
};

#[cfg(feature = "test-utils")]
pub mod test_utils;

#[cfg(feature = "metrics")]
pub mod metrics;

pub mod util;
