use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use backoff::backoff::Backoff as _;
use derive_builder::Builder;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use sluice_core::{
    CheckpointStore, Connector, DocSink, Document, FetchedBatch, PartitionId, Position,
    RetryParams, SourceConfig, Transformer,
    checkpoint::checkpoint_key,
    errors::{CheckpointError, PipelineError},
};

use crate::allocator::PipelineId;

/// Tunables of an ingestion pipeline.
#[derive(Debug, Clone, Builder)]
#[builder(default, build_fn(error = "anyhow::Error"))]
pub struct PipelineSettings {
    /// Upper bound of records fetched from a partition at once
    pub max_batch_size: usize,
    /// Wait between fetch rounds that returned nothing
    pub idle_poll_interval: Duration,
    /// How often partitions are listed again to pick up resharding
    pub partition_refresh_interval: Duration,
    /// Backoff applied between fetch rounds while the sink reports saturation
    pub backpressure: RetryParams,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 1_000,
            idle_poll_interval: Duration::from_secs(1),
            partition_refresh_interval: Duration::from_secs(30),
            backpressure: RetryParams {
                initial_interval: Duration::from_millis(100),
                max_interval: Duration::from_secs(10),
                ..RetryParams::default()
            },
        }
    }
}

impl PipelineSettings {
    pub fn builder() -> PipelineSettingsBuilder {
        PipelineSettingsBuilder::default()
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, strum_macros::Display, strum_macros::EnumIs,
)]
#[strum(serialize_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Initializing,
    Resuming,
    Fetching,
    Transforming,
    Committing,
    /// Reached the end of every partition in backfill mode.
    Drained,
    Failed,
    Stopped,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, strum_macros::Display, strum_macros::EnumIs,
)]
#[strum(serialize_all = "snake_case")]
pub enum PipelineHealth {
    #[default]
    Starting,
    Running,
    /// Restarting after a failure, or slowed down by backpressure.
    Degraded,
    Stopped,
    /// Gave up after exhausting its retry budget, or hit a fatal error.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounters {
    pub num_records: u64,
    pub num_invalid_records: u64,
    pub num_docs: u64,
    pub num_batches: u64,
    pub num_stale_commits: u64,
}

/// Snapshot of a running pipeline, as published by its supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineObservation {
    pub pipeline_id: PipelineId,
    pub health: PipelineHealth,
    pub state: PipelineState,
    pub restarts: usize,
    pub last_error: Option<String>,
    pub backpressure: bool,
    pub counters: PipelineCounters,
    /// Last position committed per partition by this pipeline.
    pub positions: BTreeMap<PartitionId, Position>,
}

impl PipelineObservation {
    pub fn new(pipeline_id: PipelineId) -> Self {
        Self {
            pipeline_id,
            health: PipelineHealth::default(),
            state: PipelineState::default(),
            restarts: 0,
            last_error: None,
            backpressure: false,
            counters: PipelineCounters::default(),
            positions: BTreeMap::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.health, PipelineHealth::Stopped | PipelineHealth::Failed)
    }
}

/// How a pipeline ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::EnumIs)]
pub enum PipelineExit {
    Drained,
    Cancelled,
    /// The source was deleted underneath the pipeline.
    SourceGone,
}

#[derive(Debug, Default)]
struct PartitionProgress {
    position: Position,
    at_end: bool,
}

/// Reads a subset of the partitions of a source, transforms the records and records progress.
///
/// Each round fetches one batch per owned partition. A batch is parsed according to the input
/// format, transformed, written to the sink and only then is its last position committed. A crash
/// anywhere before the commit makes the next run fetch the same batch again.
///
/// Cancellation is observed while waiting on the source or sleeping. A batch that has been fetched
/// is always carried through to its commit.
pub struct IngestionPipeline {
    pipeline_id: PipelineId,
    config: SourceConfig,
    connector: Arc<dyn Connector>,
    checkpoints: Arc<dyn CheckpointStore>,
    transformer: Arc<dyn Transformer>,
    sink: Arc<dyn DocSink>,
    settings: PipelineSettings,
    observer: Arc<watch::Sender<PipelineObservation>>,
    partitions: BTreeMap<PartitionId, PartitionProgress>,
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("pipeline_id", &self.pipeline_id)
            .field("connector", &self.connector)
            .field("partitions", &self.partitions.len())
            .finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_id: PipelineId,
        config: SourceConfig,
        connector: Arc<dyn Connector>,
        checkpoints: Arc<dyn CheckpointStore>,
        transformer: Arc<dyn Transformer>,
        sink: Arc<dyn DocSink>,
        settings: PipelineSettings,
        observer: Arc<watch::Sender<PipelineObservation>>,
    ) -> Self {
        Self {
            pipeline_id,
            config,
            connector,
            checkpoints,
            transformer,
            sink,
            settings,
            observer,
            partitions: BTreeMap::new(),
        }
    }

    fn source_id(&self) -> &str {
        &self.pipeline_id.source_id
    }

    fn set_state(&self, state: PipelineState) {
        self.observer.send_if_modified(|observation| {
            if observation.state == state {
                return false;
            }
            observation.state = state;
            true
        });
    }

    fn backfill_mode(&self) -> bool {
        self.config.backfill_mode_enabled() && self.connector.capabilities().supports_backfill_mode
    }

    /// Runs until cancelled, drained, or failed.
    ///
    /// # Errors
    ///
    /// Any connector, transform, sink or storage error ends the run; the supervisor decides
    /// whether to restart.
    #[tracing::instrument(skip_all, name = "ingestion_pipeline", fields(pipeline_id = %self.pipeline_id))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<PipelineExit, PipelineError> {
        self.set_state(PipelineState::Initializing);
        let listed = tokio::select! {
            () = cancel.cancelled() => return Ok(PipelineExit::Cancelled),
            listed = self.connector.list_partitions() => listed?,
        };

        self.set_state(PipelineState::Resuming);
        if let Err(err) = self.resume(listed).await {
            return source_gone_or(err);
        }
        tracing::info!(
            num_partitions = self.partitions.len(),
            backfill_mode = self.backfill_mode(),
            "pipeline resumed"
        );

        let mut backpressure = self.settings.backpressure.backoff();
        let mut last_refresh = Instant::now();
        self.observer.send_modify(|observation| {
            observation.health = PipelineHealth::Running;
        });

        loop {
            if last_refresh.elapsed() >= self.settings.partition_refresh_interval {
                let listed = tokio::select! {
                    () = cancel.cancelled() => return Ok(PipelineExit::Cancelled),
                    listed = self.connector.list_partitions() => listed?,
                };
                if let Err(err) = self.resume(listed).await {
                    return source_gone_or(err);
                }
                last_refresh = Instant::now();
            }

            let mut made_progress = false;
            let mut saturated = false;
            let partition_ids: Vec<PartitionId> = self.partitions.keys().cloned().collect();
            for partition_id in partition_ids {
                self.set_state(PipelineState::Fetching);
                let Some(from) = self
                    .partitions
                    .get(&partition_id)
                    .map(|progress| progress.position.clone())
                else {
                    continue;
                };
                let batch = tokio::select! {
                    () = cancel.cancelled() => return Ok(PipelineExit::Cancelled),
                    batch = self.connector.fetch(&partition_id, &from, self.settings.max_batch_size) => batch?,
                };
                let at_end = batch.end_of_partition;

                if !batch.is_empty() {
                    made_progress = true;
                    match self.process_batch(&partition_id, batch).await {
                        Ok(batch_saturated) => saturated |= batch_saturated,
                        Err(err) => return source_gone_or(err),
                    }
                }
                if let Some(progress) = self.partitions.get_mut(&partition_id) {
                    progress.at_end = at_end;
                }
            }

            if self.backfill_mode() && self.partitions.values().all(|progress| progress.at_end) {
                tracing::info!("reached the end of every partition, pipeline drained");
                self.set_state(PipelineState::Drained);
                return Ok(PipelineExit::Drained);
            }

            let wait = if saturated {
                let wait = backpressure
                    .next_backoff()
                    .unwrap_or(self.settings.backpressure.max_interval);
                tracing::debug!(?wait, "sink is saturated, slowing down");
                Some(wait)
            } else {
                backpressure.reset();
                (!made_progress).then_some(self.settings.idle_poll_interval)
            };
            self.observer.send_if_modified(|observation| {
                if observation.backpressure == saturated {
                    return false;
                }
                observation.backpressure = saturated;
                observation.health = if saturated {
                    PipelineHealth::Degraded
                } else {
                    PipelineHealth::Running
                };
                true
            });

            if let Some(wait) = wait {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(PipelineExit::Cancelled),
                    () = tokio::time::sleep(wait) => {}
                }
            } else if cancel.is_cancelled() {
                return Ok(PipelineExit::Cancelled);
            }
        }
    }

    /// Reconciles owned partitions with `listed`, reading the committed position of new ones.
    async fn resume(&mut self, listed: Vec<PartitionId>) -> Result<(), PipelineError> {
        let owned: BTreeSet<PartitionId> = listed
            .into_iter()
            .filter(|partition_id| self.pipeline_id.owns_partition(partition_id))
            .collect();

        let vanished: Vec<PartitionId> = self
            .partitions
            .keys()
            .filter(|partition_id| !owned.contains(*partition_id))
            .cloned()
            .collect();
        for partition_id in vanished {
            tracing::info!(%partition_id, "partition no longer listed");
            self.partitions.remove(&partition_id);
        }

        let new_partitions: Vec<&PartitionId> = owned
            .iter()
            .filter(|partition_id| !self.partitions.contains_key(*partition_id))
            .collect();
        if new_partitions.is_empty() {
            return Ok(());
        }
        let checkpoint = self.checkpoints.list(self.source_id()).await?;
        for partition_id in new_partitions {
            let position = checkpoint
                .position_for_partition(partition_id)
                .cloned()
                .unwrap_or_default();
            tracing::debug!(%partition_id, %position, "resuming partition");
            self.partitions.insert(
                partition_id.clone(),
                PartitionProgress {
                    position,
                    at_end: false,
                },
            );
        }
        Ok(())
    }

    /// Carries one batch through transform, sink and commit. Returns whether the sink is
    /// saturated.
    async fn process_batch(
        &mut self,
        partition_id: &PartitionId,
        batch: FetchedBatch,
    ) -> Result<bool, PipelineError> {
        let Some(position) = batch.last_position().cloned() else {
            return Ok(false);
        };
        let num_records = batch.records.len() as u64;

        self.set_state(PipelineState::Transforming);
        let mut documents = Vec::with_capacity(batch.records.len());
        let mut num_invalid_records = 0_u64;
        for record in &batch.records {
            match Document::from_record(record, self.config.input_format) {
                Ok(document) => documents.extend(
                    self.transformer
                        .transform(document)
                        .await
                        .map_err(PipelineError::Transform)?,
                ),
                Err(err) => {
                    num_invalid_records += 1;
                    tracing::debug!(%partition_id, position = %record.position, error = %err, "skipping invalid record");
                }
            }
        }

        let num_docs = documents.len() as u64;
        let saturated = if documents.is_empty() {
            false
        } else {
            self.sink
                .write(self.source_id(), documents)
                .await
                .map_err(PipelineError::Sink)?
                .is_saturated()
        };

        self.set_state(PipelineState::Committing);
        let committed = match self
            .checkpoints
            .commit(
                self.source_id(),
                self.config.incarnation,
                partition_id,
                position.clone(),
            )
            .await
        {
            Ok(()) => position,
            Err(CheckpointError::Stale { current, .. }) => {
                tracing::warn!(
                    checkpoint = %checkpoint_key(self.source_id(), partition_id),
                    %current,
                    attempted = %position,
                    "checkpoint moved ahead of this pipeline, resuming from the stored position"
                );
                self.observer
                    .send_modify(|observation| observation.counters.num_stale_commits += 1);
                if let Some(progress) = self.partitions.get_mut(partition_id) {
                    progress.position = current;
                }
                return Ok(saturated);
            }
            Err(err) => return Err(err.into()),
        };

        if let Err(err) = self
            .connector
            .suggest_truncate(partition_id, &committed)
            .await
        {
            tracing::warn!(%partition_id, error = %err, "failed to truncate source");
        }

        tracing::debug!(%partition_id, position = %committed, num_records, num_docs, "batch committed");
        #[cfg(feature = "metrics")]
        sluice_core::metrics::emit_batch(self.source_id(), num_records, num_invalid_records);

        self.observer.send_modify(|observation| {
            observation.counters.num_records += num_records;
            observation.counters.num_invalid_records += num_invalid_records;
            observation.counters.num_docs += num_docs;
            observation.counters.num_batches += 1;
            observation
                .positions
                .insert(partition_id.clone(), committed.clone());
        });
        if let Some(progress) = self.partitions.get_mut(partition_id) {
            progress.position = committed;
        }
        Ok(saturated)
    }
}

/// Deletion of the source is a normal way for a pipeline to end.
fn source_gone_or(err: PipelineError) -> Result<PipelineExit, PipelineError> {
    match err {
        PipelineError::Checkpoint(CheckpointError::SourceGone(source_id)) => {
            tracing::info!(%source_id, "source was deleted, stopping pipeline");
            Ok(PipelineExit::SourceGone)
        }
        err => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use sluice_core::{
        Identity, InputFormat, SourceCheckpoint, SourceIncarnation, SourceType,
        checkpoint::MockCheckpointStore,
        test_utils::{ScriptedConnector, void_source},
    };

    use super::*;
    use crate::persist::{MemoryCheckpointStore, MemorySink};

    struct Harness {
        connector: ScriptedConnector,
        checkpoints: MemoryCheckpointStore,
        sink: MemorySink,
        observer: Arc<watch::Sender<PipelineObservation>>,
        config: SourceConfig,
        pipeline_id: PipelineId,
    }

    impl Harness {
        async fn new(connector: ScriptedConnector, config: SourceConfig) -> Self {
            let checkpoints = MemoryCheckpointStore::default();
            checkpoints
                .init_source(&config.source_id, config.incarnation)
                .await
                .unwrap();
            let pipeline_id = PipelineId {
                source_id: config.source_id.clone(),
                node_id: "node".into(),
                pipeline_ord: 0,
                num_pipelines: 1,
            };
            let (observer, _) = watch::channel(PipelineObservation::new(pipeline_id.clone()));
            Self {
                connector,
                checkpoints,
                sink: MemorySink::default(),
                observer: Arc::new(observer),
                config,
                pipeline_id,
            }
        }

        fn pipeline(&self) -> IngestionPipeline {
            IngestionPipeline::new(
                self.pipeline_id.clone(),
                self.config.clone(),
                Arc::new(self.connector.clone()),
                Arc::new(self.checkpoints.clone()),
                Arc::new(Identity),
                Arc::new(self.sink.clone()),
                PipelineSettings::builder()
                    .max_batch_size(2_usize)
                    .idle_poll_interval(Duration::from_millis(10))
                    .backpressure(RetryParams::for_test())
                    .build()
                    .unwrap(),
                self.observer.clone(),
            )
        }

        fn observation(&self) -> PipelineObservation {
            self.observer.borrow().clone()
        }
    }

    fn backfill_source() -> SourceConfig {
        // void sources always drain; the scripted connector stands in for the data
        void_source("source", 1, 1)
    }

    fn streaming_source() -> SourceConfig {
        SourceConfig::builder()
            .source_id("source")
            .source_type(SourceType::Kafka)
            .param("topic", "logs")
            .build()
            .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_drains_and_commits_every_partition() {
        let connector = ScriptedConnector::default()
            .with_partition("0", [r#"{"n": 1}"#, r#"{"n": 2}"#, r#"{"n": 3}"#])
            .with_partition("1", [r#"{"n": 4}"#]);
        let harness = Harness::new(connector, backfill_source()).await;

        let exit = harness
            .pipeline()
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(exit, PipelineExit::Drained);
        assert_eq!(harness.sink.documents("source").await.len(), 4);
        assert_eq!(
            harness.checkpoints.get("source", &"0".into()).await.unwrap(),
            Some(Position::from(3_u64))
        );
        assert_eq!(
            harness.checkpoints.get("source", &"1".into()).await.unwrap(),
            Some(Position::from(1_u64))
        );
        let observation = harness.observation();
        assert_eq!(observation.state, PipelineState::Drained);
        assert_eq!(observation.counters.num_records, 4);
        assert_eq!(observation.counters.num_batches, 3);
        assert_eq!(
            harness.connector.truncations().last(),
            Some(&(PartitionId::from("0"), Position::from(3_u64)))
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_resumes_from_committed_position() {
        let connector = ScriptedConnector::default().with_partition("0", ["{}", "{}", "{}", "{}"]);
        let harness = Harness::new(connector, backfill_source()).await;
        harness
            .checkpoints
            .commit(
                "source",
                harness.config.incarnation,
                &"0".into(),
                Position::from(3_u64),
            )
            .await
            .unwrap();

        harness
            .pipeline()
            .run(CancellationToken::new())
            .await
            .unwrap();

        let documents = harness.sink.documents("source").await;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].position, Position::from(4_u64));
    }

    #[test_log::test(tokio::test)]
    async fn test_invalid_records_are_skipped_but_committed() {
        let connector =
            ScriptedConnector::default().with_partition("0", ["not json", r#"{"ok": true}"#]);
        let harness = Harness::new(connector, backfill_source()).await;

        harness
            .pipeline()
            .run(CancellationToken::new())
            .await
            .unwrap();

        let documents = harness.sink.documents("source").await;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].get("ok"), Some(&json!(true)));
        assert_eq!(harness.observation().counters.num_invalid_records, 1);
        assert_eq!(
            harness.checkpoints.get("source", &"0".into()).await.unwrap(),
            Some(Position::from(2_u64))
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_plain_text_is_wrapped() {
        let connector = ScriptedConnector::default().with_partition("0", ["hello"]);
        let mut config = backfill_source();
        config.input_format = InputFormat::PlainText;
        let harness = Harness::new(connector, config).await;

        harness
            .pipeline()
            .run(CancellationToken::new())
            .await
            .unwrap();

        let documents = harness.sink.documents("source").await;
        assert_eq!(documents[0].get("plain_text"), Some(&json!("hello")));
    }

    #[test_log::test(tokio::test)]
    async fn test_stale_commit_moves_to_stored_position() {
        let connector = ScriptedConnector::default().with_partition("0", ["{}", "{}", "{}", "{}"]);
        let harness = Harness::new(connector, backfill_source()).await;

        // another writer gets ahead between the resume and the first commit
        let mut checkpoints = MockCheckpointStore::new();
        checkpoints
            .expect_list()
            .returning(|_| Ok(SourceCheckpoint::default()));
        checkpoints
            .expect_commit()
            .times(1)
            .returning(|source_id, _, partition_id, attempted| {
                Err(CheckpointError::Stale {
                    source_id: source_id.to_string(),
                    partition_id: partition_id.clone(),
                    current: Position::from(4_u64),
                    attempted,
                })
            });
        let mut pipeline = harness.pipeline();
        pipeline.checkpoints = Arc::new(checkpoints);

        let exit = pipeline.run(CancellationToken::new()).await.unwrap();

        assert_eq!(exit, PipelineExit::Drained);
        assert_eq!(harness.sink.documents("source").await.len(), 2);
        let observation = harness.observation();
        assert_eq!(observation.counters.num_stale_commits, 1);
        assert_eq!(observation.counters.num_batches, 0);
        assert!(harness.connector.truncations().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_source_deletion_stops_the_pipeline() {
        let connector = ScriptedConnector::default().with_partition("0", ["{}"]);
        let harness = Harness::new(connector, streaming_source()).await;
        harness.checkpoints.delete_source("source").await.unwrap();

        let exit = harness
            .pipeline()
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit, PipelineExit::SourceGone);
    }

    #[test_log::test(tokio::test)]
    async fn test_pipeline_of_a_recreated_source_cannot_commit() {
        let connector = ScriptedConnector::default().with_partition("0", ["{}"]);
        let harness = Harness::new(connector, streaming_source()).await;
        harness.checkpoints.delete_source("source").await.unwrap();
        harness
            .checkpoints
            .init_source("source", SourceIncarnation::generate())
            .await
            .unwrap();

        let exit = harness
            .pipeline()
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit, PipelineExit::SourceGone);
        assert_eq!(
            harness.checkpoints.get("source", &"0".into()).await.unwrap(),
            None
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_cancellation_while_idle() {
        let connector = ScriptedConnector::default().with_partition("0", ["{}"]);
        let harness = Harness::new(connector, streaming_source()).await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(harness.pipeline().run(cancel.clone()));

        let mut rx = harness.observer.subscribe();
        rx.wait_for(|observation| observation.counters.num_batches == 1)
            .await
            .unwrap();
        cancel.cancel();

        let exit = handle.await.unwrap().unwrap();
        assert_eq!(exit, PipelineExit::Cancelled);
        assert_eq!(
            harness.checkpoints.get("source", &"0".into()).await.unwrap(),
            Some(Position::from(1_u64))
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_transient_fetch_failure_ends_the_run() {
        let connector = ScriptedConnector::default().with_partition("0", ["{}"]);
        connector.fail_next_fetches(1);
        let harness = Harness::new(connector, streaming_source()).await;

        let err = harness
            .pipeline()
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test_log::test(tokio::test)]
    async fn test_backpressure_is_observed() {
        let connector = ScriptedConnector::default().with_partition("0", ["{}", "{}", "{}"]);
        let harness = Harness::new(connector, backfill_source()).await;
        harness.sink.set_saturated(true);
        let mut rx = harness.observer.subscribe();
        let handle = tokio::spawn(harness.pipeline().run(CancellationToken::new()));

        rx.wait_for(|observation| observation.backpressure)
            .await
            .unwrap();
        assert_eq!(rx.borrow().health, PipelineHealth::Degraded);

        harness.sink.set_saturated(false);
        assert_eq!(handle.await.unwrap().unwrap(), PipelineExit::Drained);
        assert_eq!(harness.sink.documents("source").await.len(), 3);
    }
}
