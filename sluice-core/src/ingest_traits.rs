//! Seams of an ingestion pipeline beyond the connector: transforming documents, writing them out
//! and persisting source configurations.
use std::{fmt::Debug, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;

use crate::{document::Document, source_config::SourceConfig, source_config::TransformConfig};

#[cfg(feature = "test-utils")]
#[doc(hidden)]
use mockall::automock;

#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
/// Maps one document to zero or more documents, preserving order
pub trait Transformer: Send + Sync + Debug {
    async fn transform(&self, document: Document) -> Result<Vec<Document>>;
}

/// Passes documents through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

#[async_trait]
impl Transformer for Identity {
    async fn transform(&self, document: Document) -> Result<Vec<Document>> {
        Ok(vec![document])
    }
}

#[cfg_attr(feature = "test-utils", automock)]
/// Resolves the transform reference of a source into a [`Transformer`]
pub trait TransformerFactory: Send + Sync + Debug {
    /// # Errors
    ///
    /// Fails if the transform cannot be compiled.
    fn create(&self, config: &TransformConfig) -> Result<Arc<dyn Transformer>>;
}

/// Ignores transform scripts and keeps documents as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransforms;

impl TransformerFactory for IdentityTransforms {
    fn create(&self, config: &TransformConfig) -> Result<Arc<dyn Transformer>> {
        tracing::debug!(timezone = %config.timezone, "transform scripts are not interpreted, passing documents through");
        Ok(Arc::new(Identity))
    }
}

/// Saturation signal returned by a sink after a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum_macros::EnumIs)]
pub enum Backpressure {
    #[default]
    Ready,
    /// The sink accepted the documents but would like the pipeline to slow down.
    Saturated,
}

#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
/// Downstream storage the documents of a pipeline are written to
///
/// Writes may be repeated after a crash: the pipeline only guarantees the read progress is
/// recorded exactly once.
pub trait DocSink: Send + Sync + Debug {
    async fn write(&self, source_id: &str, documents: Vec<Document>) -> Result<Backpressure>;
}

#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
/// Persists source configurations
pub trait SourceStore: Send + Sync + Debug {
    async fn load_all(&self) -> Result<Vec<SourceConfig>>;

    /// Inserts or replaces the configuration with the same source id.
    async fn put(&self, config: &SourceConfig) -> Result<()>;

    /// Returns whether a configuration was removed.
    async fn delete(&self, source_id: &str) -> Result<bool>;
}
