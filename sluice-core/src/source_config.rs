//! Configuration of a source: what should be ingested, how, and with which concurrency.
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use derive_builder::Builder;

use crate::{
    SourceId,
    connector::ConnectorCapabilities,
    errors::InvalidConfigError,
    source_params::{ParamsMap, SourceParams},
};

/// Id of the implicit, node-local append source every index carries.
pub const INGEST_API_SOURCE_ID: &str = "_ingest-api-source";

lazy_static! {
    static ref SOURCE_ID_PATTERN: Regex =
        Regex::new(r"^[a-zA-Z][a-zA-Z0-9_\-]{2,254}$").expect("source id pattern is valid");
    static ref TIMEZONE_PATTERN: Regex =
        Regex::new(r"^[A-Za-z]+(?:[/_+\-][A-Za-z0-9]+)*$").expect("timezone pattern is valid");
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SourceType {
    File,
    IngestApi,
    Kafka,
    Kinesis,
    Pulsar,
    Vec,
    Void,
}

impl SourceType {
    pub fn capabilities(self) -> ConnectorCapabilities {
        let (supports_distribution, supports_backfill_mode) = match self {
            SourceType::Kafka | SourceType::Void => (true, true),
            SourceType::Pulsar => (true, false),
            SourceType::File | SourceType::Kinesis | SourceType::Vec => (false, true),
            SourceType::IngestApi => (false, false),
        };
        ConnectorCapabilities {
            supports_distribution,
            supports_backfill_mode,
        }
    }

    pub fn supports_distribution(self) -> bool {
        self.capabilities().supports_distribution
    }

    /// Sources fed through a node local queue. They run exactly one pipeline on every live node,
    /// each reading the queue of its own node.
    pub fn runs_on_every_node(self) -> bool {
        matches!(self, SourceType::IngestApi)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// Each record is a JSON object.
    #[default]
    #[serde(alias = "structured")]
    Json,
    /// Each record is free text, wrapped into `{"plain_text": ...}`.
    #[serde(alias = "unstructured")]
    PlainText,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Reference to a document transform. The script is opaque to sluice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    pub script: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl TransformConfig {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            timezone: default_timezone(),
        }
    }

    #[must_use]
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }
}

fn default_enabled() -> bool {
    true
}

/// Tells apart successive sources created under the same id.
///
/// The registry draws a fresh one whenever a source is created. Checkpoint stores only accept
/// commits carrying the incarnation the source is currently live under, so a pipeline of a
/// deleted source cannot write into a new source that reuses its id.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SourceIncarnation(Uuid);

impl SourceIncarnation {
    pub fn generate() -> Self {
        SourceIncarnation(Uuid::new_v4())
    }

    pub fn as_u128(self) -> u128 {
        self.0.as_u128()
    }

    pub const fn from_u128(value: u128) -> Self {
        SourceIncarnation(Uuid::from_u128(value))
    }
}

impl std::fmt::Display for SourceIncarnation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A configured source.
///
/// Immutable once created, except for the `enabled` flag.
///
/// # Example
///
/// ```
/// # use sluice_core::{SourceConfig, SourceType};
/// let config = SourceConfig::builder()
///     .source_id("kafka-logs")
///     .source_type(SourceType::Kafka)
///     .param("topic", "logs")
///     .desired_num_pipelines(4)
///     .max_num_pipelines_per_indexer(2)
///     .build()
///     .unwrap();
/// assert!(config.validate().is_ok());
/// assert_eq!(config.desired_num_pipelines(), 4);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Builder)]
#[builder(build_fn(error = "anyhow::Error"))]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[builder(setter(into))]
    pub source_id: SourceId,
    pub source_type: SourceType,
    /// Connector parameters, interpreted only by the matching connector.
    #[builder(default)]
    #[serde(default)]
    pub params: ParamsMap,
    #[builder(default)]
    #[serde(default)]
    pub input_format: InputFormat,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_pipelines_per_indexer: Option<usize>,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_num_pipelines: Option<usize>,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformConfig>,
    #[builder(default = "true")]
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Assigned by the registry when the source is created.
    #[builder(default)]
    #[serde(default)]
    pub incarnation: SourceIncarnation,
}

impl SourceConfigBuilder {
    /// Sets a single connector parameter.
    pub fn param(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> &mut Self {
        self.params
            .get_or_insert_with(ParamsMap::new)
            .insert(key.into(), value.into());
        self
    }
}

impl SourceConfig {
    pub fn builder() -> SourceConfigBuilder {
        SourceConfigBuilder::default()
    }

    /// The implicit append-only local ingestion source.
    pub fn ingest_api_default() -> SourceConfig {
        SourceConfig {
            source_id: INGEST_API_SOURCE_ID.to_string(),
            source_type: SourceType::IngestApi,
            params: ParamsMap::new(),
            input_format: InputFormat::Json,
            max_num_pipelines_per_indexer: None,
            desired_num_pipelines: None,
            transform: None,
            enabled: true,
            incarnation: SourceIncarnation::default(),
        }
    }

    pub fn is_implicit(&self) -> bool {
        self.source_id == INGEST_API_SOURCE_ID
    }

    pub fn capabilities(&self) -> ConnectorCapabilities {
        self.source_type.capabilities()
    }

    /// Target total concurrency across the cluster. Always 1 for non-distributable sources.
    pub fn desired_num_pipelines(&self) -> usize {
        if !self.source_type.supports_distribution() {
            return 1;
        }
        self.desired_num_pipelines.unwrap_or(1).max(1)
    }

    /// Per-node concurrency ceiling, defaulting to the desired pipeline count.
    pub fn max_num_pipelines_per_indexer(&self) -> usize {
        if !self.source_type.supports_distribution() {
            return 1;
        }
        self.max_num_pipelines_per_indexer
            .unwrap_or_else(|| self.desired_num_pipelines())
            .max(1)
    }

    /// # Errors
    ///
    /// Fails if the params do not match the source type.
    pub fn source_params(&self) -> Result<SourceParams, InvalidConfigError> {
        SourceParams::parse(self.source_type, &self.params)
    }

    pub fn backfill_mode_enabled(&self) -> bool {
        self.source_params()
            .is_ok_and(|params| params.backfill_mode_enabled())
    }

    /// Checks every constraint and reports all violations at once.
    ///
    /// # Errors
    ///
    /// Returns an [`InvalidConfigError`] listing every violated constraint.
    pub fn validate(&self) -> Result<(), InvalidConfigError> {
        let mut violations = Vec::new();

        if self.is_implicit() {
            if self.source_type != SourceType::IngestApi {
                violations.push(format!(
                    "source id `{INGEST_API_SOURCE_ID}` is reserved for the ingest API source"
                ));
            }
        } else {
            if !SOURCE_ID_PATTERN.is_match(&self.source_id) {
                violations.push(format!(
                    "source id `{}` must start with a letter, contain only ASCII letters, digits, `-` or `_`, and be 3 to 255 characters long",
                    self.source_id
                ));
            }
            if self.source_type == SourceType::IngestApi {
                violations.push(format!(
                    "source type `{}` is reserved for the implicit `{INGEST_API_SOURCE_ID}` source",
                    SourceType::IngestApi
                ));
            }
        }

        if let Err(err) = self.source_params() {
            violations.extend(err.violations);
        }

        if self.desired_num_pipelines == Some(0) {
            violations.push("`desired_num_pipelines` must be a positive integer".to_string());
        }
        if self.max_num_pipelines_per_indexer == Some(0) {
            violations.push("`max_num_pipelines_per_indexer` must be a positive integer".to_string());
        }
        if !self.source_type.supports_distribution()
            && self.desired_num_pipelines.is_some_and(|desired| desired > 1)
        {
            violations.push(format!(
                "source type `{}` does not support distribution, `desired_num_pipelines` must be 1",
                self.source_type
            ));
        }

        if let Some(transform) = &self.transform {
            if transform.script.trim().is_empty() {
                violations.push("transform `script` must not be empty".to_string());
            }
            if !TIMEZONE_PATTERN.is_match(&transform.timezone) {
                violations.push(format!(
                    "transform `timezone` `{}` is not a valid timezone name",
                    transform.timezone
                ));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(InvalidConfigError { violations })
        }
    }
}
