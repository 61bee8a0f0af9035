//! Owns the pipelines of one node: starts and stops them on instruction and restarts the ones
//! that fail.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use backoff::backoff::Backoff as _;
use derive_builder::Builder;
use futures_util::future::join_all;
use tokio::{
    sync::{Mutex, broadcast, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use sluice_core::{
    CheckpointStore, DocSink, IdentityTransforms, NodeId, RetryParams, SourceConfig,
    Transformer, TransformerFactory, errors::PipelineError,
};

use crate::{
    allocator::{Instruction, PipelineId},
    connectors::ConnectorLoader,
    pipeline::{
        IngestionPipeline, PipelineExit, PipelineHealth, PipelineObservation, PipelineSettings,
        PipelineState,
    },
};

const EVENT_CHANNEL_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Builder)]
#[builder(default, build_fn(error = "anyhow::Error"))]
pub struct SupervisorSettings {
    /// Time a pipeline gets to finish its in-flight batch once asked to stop
    pub grace_period: Duration,
    /// Restart backoff and retry budget
    pub restart: RetryParams,
    pub pipeline: PipelineSettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            restart: RetryParams::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl SupervisorSettings {
    pub fn builder() -> SupervisorSettingsBuilder {
        SupervisorSettingsBuilder::default()
    }
}

/// Lifecycle notifications, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, strum_macros::EnumIs)]
pub enum PipelineEvent {
    Started(PipelineId),
    Restarted { pipeline_id: PipelineId, attempt: usize },
    Failed { pipeline_id: PipelineId, error: String },
    Drained(PipelineId),
    Stopped(PipelineId),
}

/// A running pipeline, owned by exactly one supervisor.
#[derive(Debug)]
pub struct PipelineHandle {
    pipeline_id: PipelineId,
    cancel: CancellationToken,
    join_handle: JoinHandle<()>,
    observation: watch::Receiver<PipelineObservation>,
}

impl PipelineHandle {
    pub fn pipeline_id(&self) -> &PipelineId {
        &self.pipeline_id
    }

    pub fn observe(&self) -> PipelineObservation {
        self.observation.borrow().clone()
    }

    pub fn health(&self) -> PipelineHealth {
        self.observation.borrow().health
    }
}

/// Everything a pipeline needs besides its config, shared by all pipelines of a node.
#[derive(Debug, Clone)]
struct PipelineContext {
    connectors: Arc<ConnectorLoader>,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: Arc<dyn DocSink>,
    transforms: Arc<dyn TransformerFactory>,
    settings: SupervisorSettings,
    events: broadcast::Sender<PipelineEvent>,
}

/// Supervises the ingestion pipelines of a node.
///
/// Failed pipelines are restarted with exponential backoff until the retry budget is exhausted,
/// after which they are marked [`PipelineHealth::Failed`] and left alone. Configuration errors are
/// not retried.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use sluice_ingest::{connectors::*, persist::*, PipelineSupervisor};
/// let supervisor = PipelineSupervisor::builder()
///     .node_id("indexer-1")
///     .connectors(ConnectorLoader::with_builtin_connectors(IngestQueues::new("indexer-1")))
///     .checkpoints(MemoryCheckpointStore::default())
///     .sink(MemorySink::default())
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Builder)]
#[builder(build_fn(error = "anyhow::Error"))]
pub struct PipelineSupervisor {
    #[builder(setter(into))]
    node_id: NodeId,
    #[builder(setter(custom))]
    connectors: Arc<ConnectorLoader>,
    #[builder(setter(custom))]
    checkpoints: Arc<dyn CheckpointStore>,
    #[builder(setter(custom))]
    sink: Arc<dyn DocSink>,
    #[builder(setter(custom), default = "Arc::new(IdentityTransforms)")]
    transforms: Arc<dyn TransformerFactory>,
    #[builder(default)]
    settings: SupervisorSettings,
    #[builder(setter(skip), default = "broadcast::channel(EVENT_CHANNEL_CAPACITY).0")]
    events: broadcast::Sender<PipelineEvent>,
    #[builder(setter(skip))]
    pipelines: Mutex<BTreeMap<PipelineId, PipelineHandle>>,
}

impl PipelineSupervisorBuilder {
    pub fn connectors(&mut self, connectors: impl Into<Arc<ConnectorLoader>>) -> &mut Self {
        self.connectors = Some(connectors.into());
        self
    }

    pub fn checkpoints(&mut self, checkpoints: impl CheckpointStore + 'static) -> &mut Self {
        self.checkpoints = Some(Arc::new(checkpoints) as Arc<dyn CheckpointStore>);
        self
    }

    /// Shares a checkpoint store that other components, like the registry, also hold.
    pub fn shared_checkpoints(&mut self, checkpoints: Arc<dyn CheckpointStore>) -> &mut Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn sink(&mut self, sink: impl DocSink + 'static) -> &mut Self {
        self.sink = Some(Arc::new(sink) as Arc<dyn DocSink>);
        self
    }

    pub fn transforms(&mut self, transforms: impl TransformerFactory + 'static) -> &mut Self {
        self.transforms = Some(Arc::new(transforms) as Arc<dyn TransformerFactory>);
        self
    }
}

impl PipelineSupervisor {
    pub fn builder() -> PipelineSupervisorBuilder {
        PipelineSupervisorBuilder::default()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    fn context(&self) -> PipelineContext {
        PipelineContext {
            connectors: self.connectors.clone(),
            checkpoints: self.checkpoints.clone(),
            sink: self.sink.clone(),
            transforms: self.transforms.clone(),
            settings: self.settings.clone(),
            events: self.events.clone(),
        }
    }

    /// Applies allocator instructions in order. Instructions for other nodes are ignored.
    #[tracing::instrument(skip_all, fields(node_id = %self.node_id, num_instructions = instructions.len()))]
    pub async fn apply(&self, instructions: Vec<Instruction>) {
        let mut stops = Vec::new();
        let mut starts = Vec::new();
        for instruction in instructions {
            if instruction.pipeline_id().node_id != self.node_id {
                tracing::warn!(pipeline_id = %instruction.pipeline_id(), "ignoring instruction for another node");
                continue;
            }
            match instruction {
                Instruction::Stop { pipeline_id } => stops.push(pipeline_id),
                Instruction::Start {
                    pipeline_id,
                    config,
                } => starts.push((pipeline_id, config)),
            }
        }

        join_all(stops.iter().map(|pipeline_id| self.stop_pipeline(pipeline_id))).await;
        for (pipeline_id, config) in starts {
            self.start_pipeline(pipeline_id, config).await;
        }
    }

    /// Stops every pipeline not in `keep` and waits for all of them to be gone.
    #[tracing::instrument(skip_all, fields(node_id = %self.node_id, num_kept = keep.len()))]
    pub async fn retain(&self, keep: &[PipelineId]) {
        let stops: Vec<PipelineId> = self
            .pipeline_ids()
            .await
            .into_iter()
            .filter(|pipeline_id| !keep.contains(pipeline_id))
            .collect();
        join_all(stops.iter().map(|pipeline_id| self.stop_pipeline(pipeline_id))).await;
    }

    /// Starts a pipeline unless it is already active. Finished pipelines are replaced.
    pub async fn start_pipeline(&self, pipeline_id: PipelineId, config: SourceConfig) {
        let mut pipelines = self.pipelines.lock().await;
        if let Some(handle) = pipelines.get(&pipeline_id) {
            if !handle.observe().is_finished() {
                tracing::debug!(%pipeline_id, "pipeline already running");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let (observer, observation) =
            watch::channel(PipelineObservation::new(pipeline_id.clone()));
        let span = tracing::info_span!("pipeline", %pipeline_id, node_id = %self.node_id);
        let join_handle = tokio::spawn(
            supervise(
                self.context(),
                pipeline_id.clone(),
                config,
                cancel.clone(),
                Arc::new(observer),
            )
            .instrument(span),
        );

        tracing::info!(%pipeline_id, "pipeline started");
        let _ = self.events.send(PipelineEvent::Started(pipeline_id.clone()));
        pipelines.insert(
            pipeline_id.clone(),
            PipelineHandle {
                pipeline_id,
                cancel,
                join_handle,
                observation,
            },
        );
    }

    /// Asks a pipeline to stop and waits for it at most the grace period before aborting it.
    ///
    /// Returns whether the pipeline existed.
    pub async fn stop_pipeline(&self, pipeline_id: &PipelineId) -> bool {
        let Some(handle) = self.pipelines.lock().await.remove(pipeline_id) else {
            return false;
        };
        let PipelineHandle {
            cancel,
            mut join_handle,
            ..
        } = handle;

        cancel.cancel();
        let grace_period = self.settings.grace_period;
        if tokio::time::timeout(grace_period, &mut join_handle)
            .await
            .is_err()
        {
            tracing::warn!(%pipeline_id, ?grace_period, "pipeline ignored cancellation, aborting");
            join_handle.abort();
            let _ = self.events.send(PipelineEvent::Stopped(pipeline_id.clone()));
        }
        tracing::info!(%pipeline_id, "pipeline stopped");
        true
    }

    /// Stops every pipeline.
    pub async fn shutdown(&self) {
        let pipeline_ids = self.pipeline_ids().await;
        join_all(
            pipeline_ids
                .iter()
                .map(|pipeline_id| self.stop_pipeline(pipeline_id)),
        )
        .await;
    }

    pub async fn pipeline_ids(&self) -> Vec<PipelineId> {
        self.pipelines.lock().await.keys().cloned().collect()
    }

    pub async fn observe(&self, pipeline_id: &PipelineId) -> Option<PipelineObservation> {
        self.pipelines
            .lock()
            .await
            .get(pipeline_id)
            .map(PipelineHandle::observe)
    }

    pub async fn observations(&self) -> Vec<PipelineObservation> {
        self.pipelines
            .lock()
            .await
            .values()
            .map(PipelineHandle::observe)
            .collect()
    }

    /// Pipelines that are neither stopped nor failed.
    pub async fn num_active_pipelines(&self) -> usize {
        self.pipelines
            .lock()
            .await
            .values()
            .filter(|handle| !handle.observe().is_finished())
            .count()
    }
}

async fn run_once(
    context: &PipelineContext,
    pipeline_id: &PipelineId,
    config: &SourceConfig,
    cancel: &CancellationToken,
    observer: &Arc<watch::Sender<PipelineObservation>>,
) -> Result<PipelineExit, PipelineError> {
    let connector = context.connectors.load(config).await?;
    let transformer: Arc<dyn Transformer> = match &config.transform {
        Some(transform) => context
            .transforms
            .create(transform)
            .map_err(PipelineError::Transform)?,
        None => Arc::new(sluice_core::Identity),
    };
    IngestionPipeline::new(
        pipeline_id.clone(),
        config.clone(),
        connector,
        context.checkpoints.clone(),
        transformer,
        context.sink.clone(),
        context.settings.pipeline.clone(),
        observer.clone(),
    )
    .run(cancel.clone())
    .await
}

fn finish(
    observer: &watch::Sender<PipelineObservation>,
    health: PipelineHealth,
    state: Option<PipelineState>,
) {
    observer.send_modify(|observation| {
        observation.health = health;
        if let Some(state) = state {
            observation.state = state;
        }
    });
}

/// Runs a pipeline until it ends for good, restarting it on retryable failures.
async fn supervise(
    context: PipelineContext,
    pipeline_id: PipelineId,
    config: SourceConfig,
    cancel: CancellationToken,
    observer: Arc<watch::Sender<PipelineObservation>>,
) {
    let retry = context.settings.restart;
    let mut backoff = retry.backoff();
    let mut attempts = 0;

    loop {
        let batches_before = observer.borrow().counters.num_batches;
        let result = run_once(&context, &pipeline_id, &config, &cancel, &observer).await;

        let err = match result {
            Ok(PipelineExit::Drained) => {
                finish(&observer, PipelineHealth::Stopped, Some(PipelineState::Drained));
                let _ = context
                    .events
                    .send(PipelineEvent::Drained(pipeline_id.clone()));
                return;
            }
            Ok(PipelineExit::Cancelled | PipelineExit::SourceGone) => {
                finish(&observer, PipelineHealth::Stopped, Some(PipelineState::Stopped));
                let _ = context
                    .events
                    .send(PipelineEvent::Stopped(pipeline_id.clone()));
                return;
            }
            Err(err) => err,
        };

        // A run that committed something was healthy for a while; start a fresh budget.
        if observer.borrow().counters.num_batches > batches_before {
            attempts = 0;
            backoff.reset();
        }
        attempts += 1;

        let error = format!("{err:#}");
        if err.is_fatal() || attempts > retry.max_attempts {
            tracing::error!(error = %error, attempts, fatal = err.is_fatal(), "pipeline failed");
            observer.send_modify(|observation| {
                observation.health = PipelineHealth::Failed;
                observation.state = PipelineState::Failed;
                observation.last_error = Some(error.clone());
            });
            let _ = context.events.send(PipelineEvent::Failed {
                pipeline_id: pipeline_id.clone(),
                error,
            });
            return;
        }

        let wait = backoff.next_backoff().unwrap_or(retry.max_interval);
        tracing::warn!(error = %error, attempt = attempts, ?wait, "pipeline failed, restarting");
        observer.send_modify(|observation| {
            observation.health = PipelineHealth::Degraded;
            observation.restarts += 1;
            observation.last_error = Some(error);
        });
        #[cfg(feature = "metrics")]
        sluice_core::metrics::emit_pipeline_restart(&pipeline_id.source_id);
        let _ = context.events.send(PipelineEvent::Restarted {
            pipeline_id: pipeline_id.clone(),
            attempt: attempts,
        });

        tokio::select! {
            () = cancel.cancelled() => {
                finish(&observer, PipelineHealth::Stopped, Some(PipelineState::Stopped));
                let _ = context.events.send(PipelineEvent::Stopped(pipeline_id.clone()));
                return;
            }
            () = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use pretty_assertions::assert_eq;
    use sluice_core::{
        Backpressure, ConnectorCapabilities, Document, Position, SourceIncarnation, SourceType,
        test_utils::{ScriptedConnector, ScriptedConnectorFactory},
    };
    use tokio::sync::Notify;

    use super::*;
    use crate::persist::{MemoryCheckpointStore, MemorySink};

    const NODE: &str = "node-1";

    fn streaming_config() -> SourceConfig {
        SourceConfig::builder()
            .source_id("kafka-source")
            .source_type(SourceType::Kafka)
            .param("topic", "logs")
            .build()
            .unwrap()
    }

    fn pipeline_id() -> PipelineId {
        PipelineId {
            source_id: "kafka-source".into(),
            node_id: NODE.into(),
            pipeline_ord: 0,
            num_pipelines: 1,
        }
    }

    /// A sink whose writes never complete while `hang` is set.
    #[derive(Debug, Clone, Default)]
    struct HangingSink {
        inner: MemorySink,
        hang: Arc<AtomicBool>,
        entered: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl DocSink for HangingSink {
        async fn write(
            &self,
            source_id: &str,
            documents: Vec<Document>,
        ) -> anyhow::Result<Backpressure> {
            if self.hang.load(Ordering::SeqCst) {
                self.entered.notify_one();
                std::future::pending::<()>().await;
            }
            self.inner.write(source_id, documents).await
        }
    }

    async fn supervisor(
        connector: &ScriptedConnector,
        checkpoints: &MemoryCheckpointStore,
        sink: &(impl DocSink + Clone + 'static),
    ) -> PipelineSupervisor {
        checkpoints
            .init_source("kafka-source", SourceIncarnation::default())
            .await
            .unwrap();
        PipelineSupervisor::builder()
            .node_id(NODE)
            .connectors(ConnectorLoader::new().with_factory(ScriptedConnectorFactory::new(
                SourceType::Kafka,
                connector.clone(),
            )))
            .checkpoints(checkpoints.clone())
            .sink(sink.clone())
            .settings(
                SupervisorSettings::builder()
                    .grace_period(Duration::from_secs(1))
                    .restart(RetryParams::for_test())
                    .pipeline(
                        PipelineSettings::builder()
                            .idle_poll_interval(Duration::from_millis(5))
                            .build()
                            .unwrap(),
                    )
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    async fn wait_for(
        supervisor: &PipelineSupervisor,
        predicate: impl Fn(&PipelineObservation) -> bool,
    ) -> PipelineObservation {
        loop {
            if let Some(observation) = supervisor.observe(&pipeline_id()).await {
                if predicate(&observation) {
                    return observation;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_start_and_stop() {
        let connector = ScriptedConnector::default().with_partition("0", ["{}", "{}"]);
        let checkpoints = MemoryCheckpointStore::default();
        let sink = MemorySink::default();
        let supervisor = supervisor(&connector, &checkpoints, &sink).await;
        let mut events = supervisor.subscribe();

        supervisor
            .apply(vec![Instruction::Start {
                pipeline_id: pipeline_id(),
                config: streaming_config(),
            }])
            .await;
        assert_eq!(events.recv().await.unwrap(), PipelineEvent::Started(pipeline_id()));

        let observation = wait_for(&supervisor, |o| o.counters.num_records == 2).await;
        assert_eq!(observation.health, PipelineHealth::Running);

        // starting twice is a no-op
        supervisor
            .start_pipeline(pipeline_id(), streaming_config())
            .await;
        assert_eq!(supervisor.num_active_pipelines().await, 1);

        supervisor
            .apply(vec![Instruction::Stop {
                pipeline_id: pipeline_id(),
            }])
            .await;
        assert!(supervisor.pipeline_ids().await.is_empty());
        assert_eq!(events.recv().await.unwrap(), PipelineEvent::Stopped(pipeline_id()));
        assert_eq!(
            checkpoints.get("kafka-source", &"0".into()).await.unwrap(),
            Some(Position::from(2_u64))
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_transient_failures_are_retried() {
        let connector = ScriptedConnector::default().with_partition("0", ["{}"]);
        connector.fail_next_fetches(2);
        let checkpoints = MemoryCheckpointStore::default();
        let sink = MemorySink::default();
        let supervisor = supervisor(&connector, &checkpoints, &sink).await;

        supervisor
            .start_pipeline(pipeline_id(), streaming_config())
            .await;
        let observation = wait_for(&supervisor, |o| o.counters.num_records == 1).await;

        assert_eq!(observation.restarts, 2);
        assert_eq!(observation.health, PipelineHealth::Running);
        supervisor.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_retry_budget_is_bounded() {
        let connector = ScriptedConnector::default().with_partition("0", ["{}"]);
        connector.fail_next_fetches(usize::MAX);
        let checkpoints = MemoryCheckpointStore::default();
        let sink = MemorySink::default();
        let supervisor = supervisor(&connector, &checkpoints, &sink).await;
        let mut events = supervisor.subscribe();

        supervisor
            .start_pipeline(pipeline_id(), streaming_config())
            .await;
        let observation = wait_for(&supervisor, PipelineObservation::is_finished).await;

        assert_eq!(observation.health, PipelineHealth::Failed);
        assert_eq!(observation.restarts, RetryParams::for_test().max_attempts);
        assert!(observation.last_error.unwrap().contains("scripted fetch failure"));
        // first try plus one per restart
        assert_eq!(connector.fetch_count(), RetryParams::for_test().max_attempts + 1);

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            failed |= event.is_failed();
        }
        assert!(failed);
    }

    #[test_log::test(tokio::test)]
    async fn test_config_errors_are_not_retried() {
        let connector = ScriptedConnector::default();
        let checkpoints = MemoryCheckpointStore::default();
        let sink = MemorySink::default();
        let supervisor = supervisor(&connector, &checkpoints, &sink).await;

        let config = SourceConfig::builder()
            .source_id("kafka-source")
            .source_type(SourceType::Pulsar)
            .param("topics", vec!["logs"])
            .param("address", "pulsar://localhost:6650")
            .build()
            .unwrap();
        supervisor.start_pipeline(pipeline_id(), config).await;
        let observation = wait_for(&supervisor, PipelineObservation::is_finished).await;

        assert_eq!(observation.health, PipelineHealth::Failed);
        assert_eq!(observation.restarts, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_drained_pipelines_stop_on_their_own() {
        let connector = ScriptedConnector::new(ConnectorCapabilities {
            supports_distribution: true,
            supports_backfill_mode: true,
        })
        .with_partition("0", ["{}"]);
        let checkpoints = MemoryCheckpointStore::default();
        let sink = MemorySink::default();
        let supervisor = supervisor(&connector, &checkpoints, &sink).await;

        let mut config = streaming_config();
        config.params.insert("enable_backfill_mode".into(), true.into());
        supervisor.start_pipeline(pipeline_id(), config).await;

        let observation = wait_for(&supervisor, PipelineObservation::is_finished).await;
        assert_eq!(observation.state, PipelineState::Drained);
        assert_eq!(supervisor.num_active_pipelines().await, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_instructions_for_other_nodes_are_ignored() {
        let connector = ScriptedConnector::default();
        let checkpoints = MemoryCheckpointStore::default();
        let sink = MemorySink::default();
        let supervisor = supervisor(&connector, &checkpoints, &sink).await;

        let mut other = pipeline_id();
        other.node_id = "node-2".into();
        supervisor
            .apply(vec![Instruction::Start {
                pipeline_id: other,
                config: streaming_config(),
            }])
            .await;
        assert!(supervisor.pipeline_ids().await.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_pipeline_stuck_in_a_write_is_aborted_after_the_grace_period() {
        let connector = ScriptedConnector::default().with_partition("0", ["{}", "{}"]);
        let checkpoints = MemoryCheckpointStore::default();
        let sink = HangingSink::default();
        let mut supervisor = supervisor(&connector, &checkpoints, &sink).await;
        supervisor.settings.grace_period = Duration::from_millis(50);
        let mut events = supervisor.subscribe();

        supervisor
            .start_pipeline(pipeline_id(), streaming_config())
            .await;
        wait_for(&supervisor, |o| {
            o.positions.get(&"0".into()) == Some(&Position::from(2_u64))
        })
        .await;

        sink.hang.store(true, Ordering::SeqCst);
        let entered = sink.entered.notified();
        connector.append("0", "{}");
        entered.await;

        let stopped = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.stop_pipeline(&pipeline_id()),
        )
        .await
        .expect("stop must not wait for the stuck write");
        assert!(stopped);
        assert!(supervisor.pipeline_ids().await.is_empty());

        let mut aborted = false;
        while let Ok(event) = events.try_recv() {
            aborted |= event == PipelineEvent::Stopped(pipeline_id());
        }
        assert!(aborted);
        assert_eq!(
            checkpoints.get("kafka-source", &"0".into()).await.unwrap(),
            Some(Position::from(2_u64))
        );

        // the batch that never got written is read again after a restart
        sink.hang.store(false, Ordering::SeqCst);
        supervisor
            .start_pipeline(pipeline_id(), streaming_config())
            .await;
        wait_for(&supervisor, |o| {
            o.positions.get(&"0".into()) == Some(&Position::from(3_u64))
        })
        .await;
        assert_eq!(sink.inner.documents("kafka-source").await.len(), 3);
        supervisor.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_retain_stops_everything_else() {
        let connector = ScriptedConnector::default().with_partition("0", ["{}"]);
        let checkpoints = MemoryCheckpointStore::default();
        let sink = MemorySink::default();
        let supervisor = supervisor(&connector, &checkpoints, &sink).await;

        let mut second = pipeline_id();
        second.pipeline_ord = 1;
        second.num_pipelines = 2;
        supervisor
            .start_pipeline(pipeline_id(), streaming_config())
            .await;
        supervisor
            .start_pipeline(second.clone(), streaming_config())
            .await;

        supervisor.retain(std::slice::from_ref(&second)).await;
        assert_eq!(supervisor.pipeline_ids().await, vec![second]);
        supervisor.shutdown().await;
    }

    #[test]
    fn test_builder_requires_a_sink() {
        let err = PipelineSupervisor::builder()
            .node_id(NODE)
            .connectors(ConnectorLoader::new())
            .checkpoints(MemoryCheckpointStore::default())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("sink"), "{err}");
    }
}
