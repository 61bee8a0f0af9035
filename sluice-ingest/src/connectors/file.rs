//! Reads newline delimited records from a local file
use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt as _, AsyncSeekExt as _, BufReader};

use sluice_core::{
    Connector, ConnectorCapabilities, ConnectorFactory, FetchedBatch, PartitionId, Position,
    RawRecord, SourceConfig, SourceType, errors::ConnectorError, source_params::SourceParams,
};

/// The file is a single partition named after its path. Positions are byte offsets just past the
/// end of a line, so resuming from a position starts at the next line.
///
/// Blank lines are skipped. A last line without a trailing newline is only read once it is
/// terminated, since the file may still be written to.
#[derive(Clone, Debug)]
pub struct FileConnector {
    path: PathBuf,
    partition_id: PartitionId,
}

impl FileConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let partition_id = PartitionId::from(path.to_string_lossy().to_string());
        Self { path, partition_id }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Connector for FileConnector {
    async fn list_partitions(&self) -> Result<Vec<PartitionId>, ConnectorError> {
        Ok(vec![self.partition_id.clone()])
    }

    async fn fetch(
        &self,
        partition_id: &PartitionId,
        from: &Position,
        max_batch_size: usize,
    ) -> Result<FetchedBatch, ConnectorError> {
        if partition_id != &self.partition_id || from == &Position::Eof {
            return Ok(FetchedBatch::end_of_partition());
        }
        let mut offset = match from {
            Position::Offset(_) => from.as_u64().ok_or_else(|| {
                ConnectorError::config(format!("`{from}` is not a file source position"))
            })?,
            _ => 0,
        };

        let mut file = fs_err::tokio::File::open(&self.path)
            .await
            .map_err(ConnectorError::unavailable)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .with_context(|| format!("failed to seek to {offset}"))
            .map_err(ConnectorError::unavailable)?;
        let mut reader = BufReader::new(file);

        let mut records = Vec::new();
        let mut line = Vec::new();
        let end_of_partition = loop {
            if records.len() >= max_batch_size {
                break false;
            }
            line.clear();
            let num_bytes = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(ConnectorError::unavailable)?;
            if num_bytes == 0 || line.last() != Some(&b'\n') {
                break true;
            }
            offset += num_bytes as u64;
            let payload = line.trim_ascii();
            if payload.is_empty() {
                continue;
            }
            records.push(RawRecord::new(
                self.partition_id.clone(),
                offset,
                payload.to_vec(),
            ));
        };

        tracing::trace!(path = %self.path.display(), num_records = records.len(), "read lines");
        Ok(FetchedBatch::new(records).with_end_of_partition(end_of_partition))
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        SourceType::File.capabilities()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FileConnectorFactory;

#[async_trait]
impl ConnectorFactory for FileConnectorFactory {
    fn source_type(&self) -> SourceType {
        SourceType::File
    }

    async fn create(&self, config: &SourceConfig) -> Result<Arc<dyn Connector>, ConnectorError> {
        let params = match config.source_params() {
            Ok(SourceParams::File(params)) => params,
            Ok(_) => return Err(ConnectorError::config("expected file source params")),
            Err(err) => return Err(ConnectorError::config(err.to_string())),
        };
        if !params.filepath.is_file() {
            return Err(ConnectorError::config(format!(
                "file `{}` does not exist",
                params.filepath.display()
            )));
        }
        Ok(Arc::new(FileConnector::new(params.filepath)))
    }
}
