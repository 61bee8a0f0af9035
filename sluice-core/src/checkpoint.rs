//! Partitions, positions and the checkpoint store contract.
//!
//! Records of a source are split into partitions. Within a partition records are totally ordered
//! and each one is marked by a position. The read progress of a source is therefore fully
//! described by a mapping `PartitionId -> Position`, which is what the [`CheckpointStore`]
//! persists.
//!
//! Positions only ever move forward: a commit that does not strictly advance the stored position
//! is rejected with [`CheckpointError::Stale`]. This is what protects a partition against a
//! lingering pipeline that lost its assignment but still holds an old batch.
//!
//! Commits also carry the [`SourceIncarnation`] the pipeline was started for. Once a source is
//! deleted, commits of its pipelines fail with [`CheckpointError::SourceGone`], even after a new
//! source with the same id has been created.
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{errors::CheckpointError, source_config::SourceIncarnation};

#[cfg(feature = "test-utils")]
#[doc(hidden)]
use mockall::automock;

/// Connector specific, addressable subdivision of a source.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        PartitionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(id: &str) -> Self {
        PartitionId(id.to_string())
    }
}

impl From<String> for PartitionId {
    fn from(id: String) -> Self {
        PartitionId(id)
    }
}

impl From<u64> for PartitionId {
    fn from(id: u64) -> Self {
        PartitionId(id.to_string())
    }
}

const EOF_MARKER: &str = "~eof";

/// Opaque, strictly ordered marker of read progress within a partition.
///
/// `Beginning < Offset(_) < Eof`. Offsets made only of ASCII digits compare numerically
/// regardless of padding, which keeps Kafka offsets and Kinesis sequence numbers ordered. They
/// sort before every other offset, and other offsets compare lexicographically.
///
/// Equality and hashing follow the same order, so `"0042"` and `"42"` are the same position.
#[derive(Clone, Debug, Default)]
pub enum Position {
    #[default]
    Beginning,
    Offset(String),
    Eof,
}

impl Position {
    pub fn offset(offset: impl Into<String>) -> Self {
        Position::Offset(offset.into())
    }

    /// Returns the offset as an integer if it is a numeric offset.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Position::Offset(offset) => offset.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Position::Beginning => "",
            Position::Offset(offset) => offset,
            Position::Eof => EOF_MARKER,
        }
    }

    fn sort_key(&self) -> (u8, OffsetKey<'_>) {
        match self {
            Position::Beginning => (0, OffsetKey::Numeric(0, "")),
            Position::Offset(offset) => (1, OffsetKey::new(offset)),
            Position::Eof => (2, OffsetKey::Numeric(0, "")),
        }
    }
}

/// Numeric offsets without their leading zeros, keyed by digit count first.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
enum OffsetKey<'a> {
    Numeric(usize, &'a str),
    Text(&'a str),
}

impl<'a> OffsetKey<'a> {
    fn new(offset: &'a str) -> Self {
        if !offset.is_empty() && offset.bytes().all(|b| b.is_ascii_digit()) {
            let digits = offset.trim_start_matches('0');
            OffsetKey::Numeric(digits.len(), digits)
        } else {
            OffsetKey::Text(offset)
        }
    }
}

impl From<u64> for Position {
    fn from(offset: u64) -> Self {
        Position::Offset(format!("{offset:0>20}"))
    }
}

impl From<i64> for Position {
    fn from(offset: i64) -> Self {
        match u64::try_from(offset) {
            Ok(offset) => Position::from(offset),
            Err(_) => Position::Beginning,
        }
    }
}

impl From<&str> for Position {
    fn from(offset: &str) -> Self {
        Position::from(offset.to_string())
    }
}

impl From<String> for Position {
    fn from(offset: String) -> Self {
        match offset.as_str() {
            "" => Position::Beginning,
            EOF_MARKER => Position::Eof,
            _ => Position::Offset(offset),
        }
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Position {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for Position {}

impl Hash for Position {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sort_key().hash(state);
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Beginning => f.write_str("<beginning>"),
            Position::Offset(offset) => f.write_str(offset),
            Position::Eof => f.write_str("<eof>"),
        }
    }
}

impl FromStr for Position {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Position::from(s))
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Position::from(raw))
    }
}

/// Read progress of every partition of a single source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCheckpoint {
    per_partition: BTreeMap<PartitionId, Position>,
}

impl SourceCheckpoint {
    pub fn position_for_partition(&self, partition_id: &PartitionId) -> Option<&Position> {
        self.per_partition.get(partition_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PartitionId, &Position)> {
        self.per_partition.iter()
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = &PartitionId> {
        self.per_partition.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.per_partition.is_empty()
    }

    pub fn len(&self) -> usize {
        self.per_partition.len()
    }
}

impl FromIterator<(PartitionId, Position)> for SourceCheckpoint {
    fn from_iter<I: IntoIterator<Item = (PartitionId, Position)>>(iter: I) -> Self {
        SourceCheckpoint {
            per_partition: iter.into_iter().collect(),
        }
    }
}

/// Rejects `attempted` unless it strictly advances `current`.
///
/// Shared by store implementations so they agree on the monotonicity rule.
pub fn ensure_advances(
    source_id: &str,
    partition_id: &PartitionId,
    current: Option<&Position>,
    attempted: &Position,
) -> Result<(), CheckpointError> {
    match current {
        Some(current) if attempted <= current => Err(CheckpointError::Stale {
            source_id: source_id.to_string(),
            partition_id: partition_id.clone(),
            current: current.clone(),
            attempted: attempted.clone(),
        }),
        _ => Ok(()),
    }
}

/// Durable mapping from `(source, partition)` to the last committed position.
///
/// Every operation is atomic per key; no cross-key transactions are required. Implementations
/// must make `commit` durable before returning, since the caller acknowledges the batch upstream
/// right after.
#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    /// Marks a source as live under `incarnation`, replacing any previous incarnation.
    /// Idempotent.
    async fn init_source(
        &self,
        source_id: &str,
        incarnation: SourceIncarnation,
    ) -> Result<(), CheckpointError>;

    async fn get(
        &self,
        source_id: &str,
        partition_id: &PartitionId,
    ) -> Result<Option<Position>, CheckpointError>;

    /// All committed positions of a source. Empty if the source has no checkpoint yet.
    async fn list(&self, source_id: &str) -> Result<SourceCheckpoint, CheckpointError>;

    /// Records `position` for the partition, failing with [`CheckpointError::Stale`] if it is not
    /// strictly greater than the stored one, and with [`CheckpointError::SourceGone`] unless the
    /// source is live under `incarnation`.
    async fn commit(
        &self,
        source_id: &str,
        incarnation: SourceIncarnation,
        partition_id: &PartitionId,
        position: Position,
    ) -> Result<(), CheckpointError>;

    /// Removes every checkpoint of the source and its live marker, atomically with respect to
    /// concurrent commits.
    async fn delete_source(&self, source_id: &str) -> Result<(), CheckpointError>;
}

/// Convenience for logging which source a checkpoint belongs to.
pub fn checkpoint_key(source_id: &str, partition_id: &PartitionId) -> String {
    format!("{source_id}/{partition_id}")
}
