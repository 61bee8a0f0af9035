// show feature flags in the generated documentation
// https://doc.rust-lang.org/rustdoc/unstable-features.html#extensions-to-the-doc-attribute
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Integrations with external storage and streaming platforms.
//!
//! Everything here is behind a feature flag. Connectors are made available to pipelines by adding
//! their factory to a `ConnectorLoader`; see [`register_connectors`].

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "kinesis")]
pub mod kinesis;
#[cfg(feature = "redb")]
pub mod redb;

/// Adds the factories of every connector enabled in this build to `loader`.
#[allow(unused_mut)]
pub fn register_connectors(
    mut loader: sluice_ingest::connectors::ConnectorLoader,
) -> sluice_ingest::connectors::ConnectorLoader {
    #[cfg(feature = "kafka")]
    {
        loader = loader.with_factory(kafka::KafkaConnectorFactory);
    }
    #[cfg(feature = "kinesis")]
    {
        loader = loader.with_factory(kinesis::KinesisConnectorFactory);
    }
    loader
}
