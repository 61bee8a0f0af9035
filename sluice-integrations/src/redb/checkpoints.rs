use async_trait::async_trait;
use redb::ReadableTable as _;

use sluice_core::{
    CheckpointStore, PartitionId, Position, SourceCheckpoint, SourceIncarnation,
    checkpoint::{checkpoint_key, ensure_advances},
    errors::CheckpointError,
};

use super::{CHECKPOINTS, LIVE_SOURCES, RedbStore, open_read_table, storage};

fn source_prefix(source_id: &str) -> String {
    format!("{source_id}/")
}

#[async_trait]
impl CheckpointStore for RedbStore {
    #[tracing::instrument(skip(self))]
    async fn init_source(
        &self,
        source_id: &str,
        incarnation: SourceIncarnation,
    ) -> Result<(), CheckpointError> {
        let source_id = source_id.to_string();
        self.blocking(move |database| {
            let write_txn = database.begin_write().map_err(storage)?;
            {
                let mut live = write_txn.open_table(LIVE_SOURCES).map_err(storage)?;
                live
                    .insert(source_id.as_str(), incarnation.as_u128())
                    .map_err(storage)?;
                // Make sure reads find the table even before the first commit.
                write_txn.open_table(CHECKPOINTS).map_err(storage)?;
            }
            write_txn.commit().map_err(storage)
        })
        .await
    }

    async fn get(
        &self,
        source_id: &str,
        partition_id: &PartitionId,
    ) -> Result<Option<Position>, CheckpointError> {
        let key = checkpoint_key(source_id, partition_id);
        self.blocking(move |database| {
            let read_txn = database.begin_read().map_err(storage)?;
            let Some(table) = open_read_table(&read_txn, CHECKPOINTS)? else {
                return Ok(None);
            };
            Ok(table
                .get(key.as_str())
                .map_err(storage)?
                .map(|position| Position::from(position.value())))
        })
        .await
    }

    async fn list(&self, source_id: &str) -> Result<SourceCheckpoint, CheckpointError> {
        let prefix = source_prefix(source_id);
        self.blocking(move |database| {
            let read_txn = database.begin_read().map_err(storage)?;
            let Some(table) = open_read_table(&read_txn, CHECKPOINTS)? else {
                return Ok(SourceCheckpoint::default());
            };

            let mut positions = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(storage)? {
                let (key, position) = entry.map_err(storage)?;
                let Some(partition_id) = key.value().strip_prefix(prefix.as_str()) else {
                    break;
                };
                positions.push((
                    PartitionId::from(partition_id),
                    Position::from(position.value()),
                ));
            }
            Ok(positions.into_iter().collect())
        })
        .await
    }

    /// Compares and writes within one write transaction, so concurrent commits and source
    /// deletion are serialized by redb.
    #[tracing::instrument(skip(self), fields(position = %position))]
    async fn commit(
        &self,
        source_id: &str,
        incarnation: SourceIncarnation,
        partition_id: &PartitionId,
        position: Position,
    ) -> Result<(), CheckpointError> {
        let source_id = source_id.to_string();
        let partition_id = partition_id.clone();
        self.blocking(move |database| {
            let write_txn = database.begin_write().map_err(storage)?;
            {
                let live = write_txn.open_table(LIVE_SOURCES).map_err(storage)?;
                let live_incarnation = live
                    .get(source_id.as_str())
                    .map_err(storage)?
                    .map(|incarnation| SourceIncarnation::from_u128(incarnation.value()));
                if live_incarnation != Some(incarnation) {
                    return Err(CheckpointError::SourceGone(source_id));
                }

                let key = checkpoint_key(&source_id, &partition_id);
                let mut checkpoints = write_txn.open_table(CHECKPOINTS).map_err(storage)?;
                let current = checkpoints
                    .get(key.as_str())
                    .map_err(storage)?
                    .map(|position| Position::from(position.value()));
                ensure_advances(&source_id, &partition_id, current.as_ref(), &position)?;
                checkpoints
                    .insert(key.as_str(), position.as_str())
                    .map_err(storage)?;
            }
            write_txn.commit().map_err(storage)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn delete_source(&self, source_id: &str) -> Result<(), CheckpointError> {
        let source_id = source_id.to_string();
        self.blocking(move |database| {
            let prefix = source_prefix(&source_id);
            let write_txn = database.begin_write().map_err(storage)?;
            {
                let mut live = write_txn.open_table(LIVE_SOURCES).map_err(storage)?;
                live.remove(source_id.as_str()).map_err(storage)?;

                let mut checkpoints = write_txn.open_table(CHECKPOINTS).map_err(storage)?;
                let mut keys = Vec::new();
                for entry in checkpoints.range(prefix.as_str()..).map_err(storage)? {
                    let (key, _) = entry.map_err(storage)?;
                    if !key.value().starts_with(prefix.as_str()) {
                        break;
                    }
                    keys.push(key.value().to_string());
                }
                for key in &keys {
                    checkpoints.remove(key.as_str()).map_err(storage)?;
                }
                tracing::debug!(num_checkpoints = keys.len(), "removed checkpoints");
            }
            write_txn.commit().map_err(storage)
        })
        .await
    }
}
