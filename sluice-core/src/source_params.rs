//! Typed views over the opaque connector parameters of a [`crate::SourceConfig`].
//!
//! The registry stores parameters as a JSON map; they are only interpreted here (for validation)
//! and by the matching connector.
use std::path::PathBuf;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::{errors::InvalidConfigError, source_config::SourceType};

pub type ParamsMap = JsonMap<String, JsonValue>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSourceParams {
    pub filepath: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestApiSourceParams {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaSourceParams {
    pub topic: String,
    /// librdkafka client properties, passed through verbatim.
    #[serde(default)]
    pub client_params: ParamsMap,
    #[serde(default)]
    pub enable_backfill_mode: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KinesisSourceParams {
    pub stream_name: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint, e.g. for localstack. Mutually exclusive with `region`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub enable_backfill_mode: bool,
}

fn default_consumer_name() -> String {
    "sluice".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PulsarSourceParams {
    pub topics: Vec<String>,
    pub address: String,
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
}

fn default_batch_num_docs() -> usize {
    100
}

/// In-memory source, mostly useful for tests and demos.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VecSourceParams {
    #[serde(default)]
    pub docs: Vec<String>,
    #[serde(default = "default_batch_num_docs")]
    pub batch_num_docs: usize,
    #[serde(default)]
    pub partition: String,
}

impl Default for VecSourceParams {
    fn default() -> Self {
        Self {
            docs: Vec::new(),
            batch_num_docs: default_batch_num_docs(),
            partition: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoidSourceParams {}

#[derive(Clone, Debug, PartialEq, strum_macros::EnumIs)]
pub enum SourceParams {
    File(FileSourceParams),
    IngestApi(IngestApiSourceParams),
    Kafka(KafkaSourceParams),
    Kinesis(KinesisSourceParams),
    Pulsar(PulsarSourceParams),
    Vec(VecSourceParams),
    Void(VoidSourceParams),
}

/// Reads typed fields out of a raw params map, collecting every problem instead of stopping at
/// the first one.
struct ParamsReader<'a> {
    source_type: SourceType,
    params: &'a ParamsMap,
    known: Vec<&'static str>,
    violations: Vec<String>,
}

impl<'a> ParamsReader<'a> {
    fn new(source_type: SourceType, params: &'a ParamsMap) -> Self {
        Self {
            source_type,
            params,
            known: Vec::new(),
            violations: Vec::new(),
        }
    }

    /// `None` when the key is absent or holds a value of the wrong type.
    fn optional<T: DeserializeOwned>(&mut self, key: &'static str) -> Option<T> {
        self.known.push(key);
        let value = self.params.get(key)?;
        match T::deserialize(value) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                self.violations.push(format!(
                    "`{}` source param `{key}` is invalid: {err}",
                    self.source_type
                ));
                None
            }
        }
    }

    fn required<T: DeserializeOwned>(&mut self, key: &'static str) -> Option<T> {
        if !self.params.contains_key(key) {
            self.violations.push(format!(
                "`{}` source param `{key}` is required",
                self.source_type
            ));
        }
        self.optional(key)
    }

    fn violation(&mut self, violation: impl Into<String>) {
        self.violations.push(violation.into());
    }

    fn finish(mut self, parsed: Option<SourceParams>) -> Result<SourceParams, InvalidConfigError> {
        for key in self.params.keys() {
            if !self.known.contains(&key.as_str()) {
                let expected = if self.known.is_empty() {
                    "it takes no params".to_string()
                } else {
                    format!("expected one of `{}`", self.known.join("`, `"))
                };
                self.violations.push(format!(
                    "unknown `{}` source param `{key}`, {expected}",
                    self.source_type
                ));
            }
        }
        match parsed {
            Some(parsed) if self.violations.is_empty() => Ok(parsed),
            _ => Err(InvalidConfigError::new(self.violations)),
        }
    }
}

fn read_file(reader: &mut ParamsReader<'_>) -> Option<SourceParams> {
    let filepath: Option<PathBuf> = reader.required("filepath");
    if filepath.as_ref().is_some_and(|path| path.as_os_str().is_empty()) {
        reader.violation("file source `filepath` must not be empty");
    }
    Some(SourceParams::File(FileSourceParams {
        filepath: filepath?,
    }))
}

fn read_kafka(reader: &mut ParamsReader<'_>) -> Option<SourceParams> {
    let topic: Option<String> = reader.required("topic");
    let client_params: Option<ParamsMap> = reader.optional("client_params");
    let enable_backfill_mode = reader.optional("enable_backfill_mode");

    if topic.as_deref().is_some_and(|topic| topic.trim().is_empty()) {
        reader.violation("kafka source `topic` must not be empty");
    }
    for (key, value) in client_params.iter().flatten() {
        if !(value.is_string() || value.is_number() || value.is_boolean()) {
            reader.violation(format!(
                "kafka client param `{key}` must be a string, number or boolean"
            ));
        }
    }
    Some(SourceParams::Kafka(KafkaSourceParams {
        topic: topic?,
        client_params: client_params.unwrap_or_default(),
        enable_backfill_mode: enable_backfill_mode.unwrap_or_default(),
    }))
}

fn read_kinesis(reader: &mut ParamsReader<'_>) -> Option<SourceParams> {
    let stream_name: Option<String> = reader.required("stream_name");
    let region: Option<String> = reader.optional("region");
    let endpoint: Option<String> = reader.optional("endpoint");
    let enable_backfill_mode = reader.optional("enable_backfill_mode");

    if stream_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
        reader.violation("kinesis source `stream_name` must not be empty");
    }
    if region.is_some() && endpoint.is_some() {
        reader.violation("kinesis source `region` and `endpoint` are mutually exclusive");
    }
    if let Some(endpoint) = &endpoint {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            reader.violation(format!(
                "kinesis source `endpoint` must be an http(s) URL, got `{endpoint}`"
            ));
        }
    }
    Some(SourceParams::Kinesis(KinesisSourceParams {
        stream_name: stream_name?,
        region,
        endpoint,
        enable_backfill_mode: enable_backfill_mode.unwrap_or_default(),
    }))
}

fn read_pulsar(reader: &mut ParamsReader<'_>) -> Option<SourceParams> {
    let topics: Option<Vec<String>> = reader.required("topics");
    let address: Option<String> = reader.required("address");
    let consumer_name = reader.optional("consumer_name");

    if topics
        .as_ref()
        .is_some_and(|topics| topics.is_empty() || topics.iter().any(|t| t.trim().is_empty()))
    {
        reader.violation("pulsar source `topics` must be a list of non-empty names");
    }
    if let Some(address) = &address {
        if !(address.starts_with("pulsar://") || address.starts_with("pulsar+ssl://")) {
            reader.violation(format!(
                "pulsar source `address` must start with `pulsar://` or `pulsar+ssl://`, got `{address}`"
            ));
        }
    }
    Some(SourceParams::Pulsar(PulsarSourceParams {
        topics: topics?,
        address: address?,
        consumer_name: consumer_name.unwrap_or_else(default_consumer_name),
    }))
}

fn read_vec(reader: &mut ParamsReader<'_>) -> Option<SourceParams> {
    let docs = reader.optional("docs");
    let batch_num_docs = reader.optional("batch_num_docs");
    let partition = reader.optional("partition");

    if batch_num_docs == Some(0) {
        reader.violation("vec source `batch_num_docs` must be positive");
    }
    Some(SourceParams::Vec(VecSourceParams {
        docs: docs.unwrap_or_default(),
        batch_num_docs: batch_num_docs.unwrap_or_else(default_batch_num_docs),
        partition: partition.unwrap_or_default(),
    }))
}

impl SourceParams {
    /// Interprets `params` according to `source_type`.
    ///
    /// # Errors
    ///
    /// Lists every violation at once: unknown keys, missing required keys, values of the wrong
    /// type, and the range and cross-field constraints of that source type.
    pub fn parse(source_type: SourceType, params: &ParamsMap) -> Result<Self, InvalidConfigError> {
        let mut reader = ParamsReader::new(source_type, params);
        let parsed = match source_type {
            SourceType::File => read_file(&mut reader),
            SourceType::IngestApi => Some(SourceParams::IngestApi(IngestApiSourceParams {})),
            SourceType::Kafka => read_kafka(&mut reader),
            SourceType::Kinesis => read_kinesis(&mut reader),
            SourceType::Pulsar => read_pulsar(&mut reader),
            SourceType::Vec => read_vec(&mut reader),
            SourceType::Void => Some(SourceParams::Void(VoidSourceParams {})),
        };
        reader.finish(parsed)
    }

    /// Whether the pipeline should terminate once it reaches the end of the available data.
    pub fn backfill_mode_enabled(&self) -> bool {
        match self {
            SourceParams::Kafka(params) => params.enable_backfill_mode,
            SourceParams::Kinesis(params) => params.enable_backfill_mode,
            SourceParams::File(_) | SourceParams::Vec(_) | SourceParams::Void(_) => true,
            SourceParams::IngestApi(_) | SourceParams::Pulsar(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn params(value: JsonValue) -> ParamsMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_kinesis_region_and_endpoint_are_exclusive() {
        let err = SourceParams::parse(
            SourceType::Kinesis,
            &params(json!({
                "stream_name": "logs",
                "region": "eu-west-1",
                "endpoint": "http://localhost:4566"
            })),
        )
        .unwrap_err();
        assert_eq!(
            err.violations,
            vec!["kinesis source `region` and `endpoint` are mutually exclusive".to_string()]
        );
    }

    #[test]
    fn test_every_kinesis_violation_is_reported() {
        let err = SourceParams::parse(
            SourceType::Kinesis,
            &params(json!({
                "region": "eu-west-1",
                "endpoint": "ftp://localhost:4566",
                "bogus": true
            })),
        )
        .unwrap_err();
        assert_eq!(
            err.violations,
            vec![
                "`kinesis` source param `stream_name` is required".to_string(),
                "kinesis source `region` and `endpoint` are mutually exclusive".to_string(),
                "kinesis source `endpoint` must be an http(s) URL, got `ftp://localhost:4566`"
                    .to_string(),
                "unknown `kinesis` source param `bogus`, expected one of `stream_name`, `region`, `endpoint`, `enable_backfill_mode`".to_string(),
            ]
        );
    }

    #[test]
    fn test_wrong_types_are_reported_per_field() {
        let err = SourceParams::parse(
            SourceType::Kafka,
            &params(json!({"topic": 42, "enable_backfill_mode": "yes"})),
        )
        .unwrap_err();
        assert_eq!(err.violations.len(), 2);
        assert!(err.violations[0].starts_with("`kafka` source param `topic` is invalid"));
        assert!(err.violations[1].starts_with("`kafka` source param `enable_backfill_mode` is invalid"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = SourceParams::parse(
            SourceType::File,
            &params(json!({"filepath": "a.json", "compression": "gzip"})),
        )
        .unwrap_err();
        assert_eq!(
            err.violations,
            vec!["unknown `file` source param `compression`, expected one of `filepath`".to_string()]
        );

        let err =
            SourceParams::parse(SourceType::Void, &params(json!({"rate": 1}))).unwrap_err();
        assert_eq!(
            err.violations,
            vec!["unknown `void` source param `rate`, it takes no params".to_string()]
        );
    }

    #[test]
    fn test_missing_required_field() {
        let err = SourceParams::parse(SourceType::Kafka, &ParamsMap::new()).unwrap_err();
        assert_eq!(
            err.violations,
            vec!["`kafka` source param `topic` is required".to_string()]
        );
    }

    #[test]
    fn test_backfill_mode() {
        let kafka = SourceParams::parse(
            SourceType::Kafka,
            &params(json!({"topic": "t", "enable_backfill_mode": true})),
        )
        .unwrap();
        assert!(kafka.backfill_mode_enabled());

        let ingest = SourceParams::parse(SourceType::IngestApi, &ParamsMap::new()).unwrap();
        assert!(!ingest.backfill_mode_enabled());
    }

    #[test]
    fn test_vec_defaults() {
        let parsed = SourceParams::parse(SourceType::Vec, &ParamsMap::new()).unwrap();
        assert_eq!(parsed, SourceParams::Vec(VecSourceParams::default()));
    }
}
