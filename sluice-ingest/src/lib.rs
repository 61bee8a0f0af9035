// show feature flags in the generated documentation
// https://doc.rust-lang.org/rustdoc/unstable-features.html#extensions-to-the-doc-attribute
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Source registry, pipeline allocation and the ingestion pipelines themselves.
//!
//! The [`SourceRegistry`] holds what should run, the [`ControlLoop`] decides where it runs using
//! the [`allocator`], and a [`PipelineSupervisor`] on every node runs the resulting
//! [`IngestionPipeline`]s.

pub mod allocator;
pub mod connectors;
pub mod control_loop;
pub mod persist;
pub mod pipeline;
pub mod registry;
pub mod supervisor;

pub use allocator::{Assignment, Instruction, PipelineAllocator, PipelineId, Rebalance};
pub use control_loop::{ClusterMembership, ControlLoop, ControlLoopSettings, NodeClient};
pub use pipeline::{
    IngestionPipeline, PipelineExit, PipelineHealth, PipelineObservation, PipelineSettings,
    PipelineState,
};
pub use registry::SourceRegistry;
pub use supervisor::{PipelineEvent, PipelineSupervisor, SupervisorSettings};
