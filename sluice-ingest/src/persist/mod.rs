//! In-memory implementations of the storage traits.
//!
//! Great for experimentation, tests and single node setups where losing progress on restart is
//! acceptable. See the `redb` integration for a durable store.
mod memory_checkpoints;
mod memory_sink;
mod memory_sources;

pub use memory_checkpoints::MemoryCheckpointStore;
pub use memory_sink::{MemorySink, MemorySinkBuilder};
pub use memory_sources::MemorySourceStore;
