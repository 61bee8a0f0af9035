use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;

use sluice_core::{
    CheckpointStore, PartitionId, Position, SourceCheckpoint, SourceId, SourceIncarnation,
    checkpoint::ensure_advances, errors::CheckpointError,
};

#[derive(Debug, Default)]
struct State {
    live_sources: BTreeMap<SourceId, SourceIncarnation>,
    positions: BTreeMap<SourceId, BTreeMap<PartitionId, Position>>,
}

/// Checkpoint store kept in memory.
///
/// Every operation takes the same lock, which makes commits and source deletion trivially
/// atomic with respect to each other. Clones share their state.
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<State>>,
}

impl MemoryCheckpointStore {
    fn lock(&self) -> Result<MutexGuard<'_, State>, CheckpointError> {
        self.state
            .lock()
            .map_err(|_| CheckpointError::Storage(anyhow::anyhow!("checkpoint lock poisoned")))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn init_source(
        &self,
        source_id: &str,
        incarnation: SourceIncarnation,
    ) -> Result<(), CheckpointError> {
        self.lock()?
            .live_sources
            .insert(source_id.to_string(), incarnation);
        Ok(())
    }

    async fn get(
        &self,
        source_id: &str,
        partition_id: &PartitionId,
    ) -> Result<Option<Position>, CheckpointError> {
        Ok(self
            .lock()?
            .positions
            .get(source_id)
            .and_then(|partitions| partitions.get(partition_id))
            .cloned())
    }

    async fn list(&self, source_id: &str) -> Result<SourceCheckpoint, CheckpointError> {
        Ok(self
            .lock()?
            .positions
            .get(source_id)
            .map(|partitions| {
                partitions
                    .iter()
                    .map(|(partition_id, position)| (partition_id.clone(), position.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(
        &self,
        source_id: &str,
        incarnation: SourceIncarnation,
        partition_id: &PartitionId,
        position: Position,
    ) -> Result<(), CheckpointError> {
        let mut state = self.lock()?;
        if state.live_sources.get(source_id) != Some(&incarnation) {
            return Err(CheckpointError::SourceGone(source_id.to_string()));
        }
        let partitions = state.positions.entry(source_id.to_string()).or_default();
        ensure_advances(
            source_id,
            partition_id,
            partitions.get(partition_id),
            &position,
        )?;
        partitions.insert(partition_id.clone(), position);
        Ok(())
    }

    async fn delete_source(&self, source_id: &str) -> Result<(), CheckpointError> {
        let mut state = self.lock()?;
        state.live_sources.remove(source_id);
        state.positions.remove(source_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE: SourceIncarnation = SourceIncarnation::from_u128(1);

    #[tokio::test]
    async fn test_commits_must_advance() {
        let store = MemoryCheckpointStore::default();
        let partition = PartitionId::from("0");
        store.init_source("source", LIVE).await.unwrap();

        store
            .commit("source", LIVE, &partition, Position::from(5_u64))
            .await
            .unwrap();
        let err = store
            .commit("source", LIVE, &partition, Position::from(5_u64))
            .await
            .unwrap_err();
        assert!(err.is_stale());
        let err = store
            .commit("source", LIVE, &partition, Position::from(4_u64))
            .await
            .unwrap_err();
        assert!(err.is_stale());
        store
            .commit("source", LIVE, &partition, Position::from(6_u64))
            .await
            .unwrap();

        assert_eq!(
            store.get("source", &partition).await.unwrap(),
            Some(Position::from(6_u64))
        );
    }

    #[tokio::test]
    async fn test_commit_to_unknown_source_is_rejected() {
        let store = MemoryCheckpointStore::default();
        let err = store
            .commit("ghost", LIVE, &PartitionId::from("0"), Position::from(1_u64))
            .await
            .unwrap_err();
        assert!(err.is_source_gone());
    }

    #[tokio::test]
    async fn test_delete_source_removes_everything() {
        let store = MemoryCheckpointStore::default();
        store.init_source("source", LIVE).await.unwrap();
        store.init_source("other", LIVE).await.unwrap();
        for partition in ["0", "1", "2"] {
            store
                .commit("source", LIVE, &partition.into(), Position::from(1_u64))
                .await
                .unwrap();
        }
        store
            .commit("other", LIVE, &"0".into(), Position::from(1_u64))
            .await
            .unwrap();

        store.delete_source("source").await.unwrap();

        assert!(store.list("source").await.unwrap().is_empty());
        for partition in ["0", "1", "2"] {
            assert_eq!(store.get("source", &partition.into()).await.unwrap(), None);
        }
        assert_eq!(store.list("other").await.unwrap().len(), 1);

        let err = store
            .commit("source", LIVE, &"0".into(), Position::from(2_u64))
            .await
            .unwrap_err();
        assert!(err.is_source_gone());
    }

    #[tokio::test]
    async fn test_recreated_source_rejects_commits_of_the_old_incarnation() {
        let store = MemoryCheckpointStore::default();
        let recreated = SourceIncarnation::from_u128(2);
        store.init_source("source", LIVE).await.unwrap();
        store
            .commit("source", LIVE, &"0".into(), Position::from(7_u64))
            .await
            .unwrap();

        store.delete_source("source").await.unwrap();
        store.init_source("source", recreated).await.unwrap();

        let err = store
            .commit("source", LIVE, &"0".into(), Position::from(8_u64))
            .await
            .unwrap_err();
        assert!(err.is_source_gone());
        assert!(store.list("source").await.unwrap().is_empty());

        store
            .commit("source", recreated, &"0".into(), Position::from(1_u64))
            .await
            .unwrap();
    }
}
