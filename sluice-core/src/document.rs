use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::{
    checkpoint::{PartitionId, Position},
    connector::RawRecord,
    source_config::InputFormat,
    util::debug_long_utf8,
};

/// Field plain text payloads are wrapped into.
pub const PLAIN_TEXT_FIELD: &str = "plain_text";

/// A record turned into a JSON document, carrying where it was read from.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub partition_id: PartitionId,
    pub position: Position,
    pub body: JsonMap<String, JsonValue>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = JsonValue::Object(self.body.clone()).to_string();
        f.debug_struct("Document")
            .field("partition_id", &self.partition_id)
            .field("position", &self.position)
            .field("body", &debug_long_utf8(body, 100))
            .finish()
    }
}

impl Document {
    pub fn new(
        partition_id: impl Into<PartitionId>,
        position: impl Into<Position>,
        body: JsonMap<String, JsonValue>,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            position: position.into(),
            body,
        }
    }

    /// Parses a raw record according to the input format.
    ///
    /// # Errors
    ///
    /// Json payloads must be a JSON object, plain text payloads must be valid utf8.
    pub fn from_record(record: &RawRecord, input_format: InputFormat) -> anyhow::Result<Self> {
        let body = match input_format {
            InputFormat::Json => match serde_json::from_slice::<JsonValue>(&record.payload)? {
                JsonValue::Object(body) => body,
                other => anyhow::bail!("expected a JSON object, got `{other}`"),
            },
            InputFormat::PlainText => {
                let text = std::str::from_utf8(&record.payload)?;
                let mut body = JsonMap::new();
                body.insert(
                    PLAIN_TEXT_FIELD.to_string(),
                    JsonValue::String(text.to_string()),
                );
                body
            }
        };
        Ok(Self {
            partition_id: record.partition_id.clone(),
            position: record.position.clone(),
            body,
        })
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.body.get(field)
    }

    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.body.insert(field.into(), value.into());
        self
    }
}
