//! # Sluice
//!
//! Sluice decides which ingestion pipelines run where in a cluster of indexer nodes and keeps
//! track of how far each of them has read, so that pipelines can be stopped, moved and restarted
//! without losing or re-recording progress.
//!
//! ## Features
//!
//! - A source registry validating source configurations and reporting every violation at once
//! - A deterministic, stability-biased allocator spreading pipelines evenly over nodes while
//!   respecting per-node caps, with only the delta sent to each node
//! - Per-node supervisors restarting failed pipelines with bounded exponential backoff
//! - Checkpointed pipelines that only record progress after the batch has been written, and a
//!   checkpoint store that rejects stale commits from lingering pipelines
//! - Connectors for files, an in-process ingest API, Kafka and Kinesis
//! - `tracing` supported for logging and tracing
//!
//! ## Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use anyhow::Result;
//! # use sluice::{ingest::*, ingest::persist::*, ingest::connectors::IngestQueues, *};
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let connectors = connector_loader(IngestQueues::new("indexer-1"));
//! let checkpoints = Arc::new(MemoryCheckpointStore::default());
//! let registry = Arc::new(
//!     SourceRegistry::open(
//!         Arc::new(MemorySourceStore::default()),
//!         checkpoints.clone(),
//!         connectors.supported_types(),
//!     )
//!     .await?,
//! );
//!
//! let supervisor = Arc::new(
//!     PipelineSupervisor::builder()
//!         .node_id("indexer-1")
//!         .connectors(connectors)
//!         .shared_checkpoints(checkpoints)
//!         .sink(MemorySink::default())
//!         .build()?,
//! );
//! let membership = ClusterMembership::default();
//! membership.join("indexer-1", supervisor);
//!
//! let control_loop = ControlLoop::new(registry, membership, ControlLoopSettings::default());
//! control_loop.run(tokio_util::sync::CancellationToken::new()).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! Integrations pulling in heavy client libraries are behind feature flags.
#![doc = document_features::document_features!()]

use sluice_ingest::connectors::{ConnectorLoader, IngestQueues};

#[doc(inline)]
pub use sluice_core::type_aliases::*;
#[doc(inline)]
pub use sluice_core::{
    CheckpointStore, Connector, ConnectorFactory, PartitionId, Position, SourceCheckpoint,
    SourceConfig, SourceIncarnation, SourceType,
};

/// Common traits, re-exported from the core
pub mod traits {
    #[doc(inline)]
    pub use sluice_core::ingest_traits::*;
    #[doc(inline)]
    pub use sluice_core::{CheckpointStore, Connector, ConnectorFactory};
}

/// Errors of every component
pub mod errors {
    #[doc(inline)]
    pub use sluice_core::errors::*;
}

/// Registry, allocator, supervisor and pipelines.
///
/// The control plane flows one way: source configs and cluster membership produce an
/// [`Assignment`](ingest::Assignment), which is turned into instructions for the supervisors of
/// each node. Supervisor state only feeds back as observations and events.
pub mod ingest {
    #[doc(inline)]
    pub use sluice_ingest::*;
}

/// Integrations with external storage and streaming platforms.
pub mod integrations {
    #[doc(inline)]
    pub use sluice_integrations::*;
}

/// A loader with the built-in connectors and every integration enabled in this build.
pub fn connector_loader(queues: IngestQueues) -> ConnectorLoader {
    sluice_integrations::register_connectors(ConnectorLoader::with_builtin_connectors(queues))
}

/// Source types this build can run pipelines for.
pub fn supported_connectors() -> Vec<SourceType> {
    connector_loader(IngestQueues::new("local")).supported_types()
}

#[doc(hidden)]
#[cfg(feature = "test-utils")]
pub mod test_utils {
    pub use sluice_core::test_utils::*;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_connectors_are_always_supported() {
        let supported = supported_connectors();
        for source_type in [
            SourceType::File,
            SourceType::IngestApi,
            SourceType::Vec,
            SourceType::Void,
        ] {
            assert!(supported.contains(&source_type), "{source_type} missing");
        }
        assert_eq!(
            supported.contains(&SourceType::Kafka),
            cfg!(feature = "kafka")
        );
        assert!(!supported.contains(&SourceType::Pulsar));
    }
}
