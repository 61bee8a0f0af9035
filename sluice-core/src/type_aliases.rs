/// Identifier of a configured source, unique within an index.
pub type SourceId = String;

/// Identifier of an indexer node, as reported by cluster membership.
pub type NodeId = String;
