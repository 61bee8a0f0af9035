//! Keeps the pipelines running across the cluster in line with the registry and the membership.
//!
//! Whenever the enabled sources or the set of live nodes change, the control loop asks the
//! [`PipelineAllocator`] for a new assignment and sends each affected node the instructions that
//! concern it. A node that could not be reached is marked out of sync and receives its complete
//! desired state on a later pass instead of an incremental plan.
//!
//! Dispatch happens in two phases. Every node first stops what it no longer owns, and only once all
//! of them answered are the starts sent out, so two nodes never read the same partitions at once.
//! A node that fails to confirm its stops holds back the starts of the sources it was asked to stop.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use derive_builder::Builder;
use futures_util::future::join_all;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use sluice_core::{NodeId, SourceConfig, SourceId};

use crate::{
    allocator::{Assignment, Instruction, PipelineAllocator, PipelineId, Rebalance},
    registry::SourceRegistry,
    supervisor::PipelineSupervisor,
};

#[cfg(test)]
use mockall::automock;

/// How the control loop reaches the supervisor of a node.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeClient: Send + Sync + Debug {
    /// Applies an incremental plan.
    async fn apply(&self, instructions: Vec<Instruction>) -> anyhow::Result<()>;

    /// Stops every pipeline not in `keep`, returning once they are gone.
    async fn retain(&self, keep: Vec<PipelineId>) -> anyhow::Result<()>;
}

#[async_trait]
impl NodeClient for PipelineSupervisor {
    async fn apply(&self, instructions: Vec<Instruction>) -> anyhow::Result<()> {
        PipelineSupervisor::apply(self, instructions).await;
        Ok(())
    }

    async fn retain(&self, keep: Vec<PipelineId>) -> anyhow::Result<()> {
        PipelineSupervisor::retain(self, &keep).await;
        Ok(())
    }
}

/// Live indexer nodes and how to reach them.
///
/// Cloning is cheap; all clones observe the same membership.
#[derive(Debug, Clone)]
pub struct ClusterMembership {
    members: Arc<watch::Sender<BTreeMap<NodeId, Arc<dyn NodeClient>>>>,
}

impl Default for ClusterMembership {
    fn default() -> Self {
        let (members, _) = watch::channel(BTreeMap::new());
        Self {
            members: Arc::new(members),
        }
    }
}

impl ClusterMembership {
    pub fn join(&self, node_id: impl Into<NodeId>, client: Arc<dyn NodeClient>) {
        let node_id = node_id.into();
        tracing::info!(%node_id, "node joined");
        self.members.send_modify(|members| {
            members.insert(node_id, client);
        });
    }

    /// Returns whether the node was a member.
    pub fn leave(&self, node_id: &str) -> bool {
        let left = self
            .members
            .send_if_modified(|members| members.remove(node_id).is_some());
        if left {
            tracing::info!(%node_id, "node left");
        }
        left
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.members.borrow().keys().cloned().collect()
    }

    fn clients(&self) -> BTreeMap<NodeId, Arc<dyn NodeClient>> {
        self.members.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<BTreeMap<NodeId, Arc<dyn NodeClient>>> {
        self.members.subscribe()
    }
}

#[derive(Debug, Clone, Builder)]
#[builder(default, build_fn(error = "anyhow::Error"))]
pub struct ControlLoopSettings {
    /// Upper bound for a single node to acknowledge its instructions
    pub dispatch_timeout: Duration,
    /// Reconcile at least this often, even without changes
    pub resync_interval: Duration,
}

impl Default for ControlLoopSettings {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(10),
            resync_interval: Duration::from_secs(60),
        }
    }
}

impl ControlLoopSettings {
    pub fn builder() -> ControlLoopSettingsBuilder {
        ControlLoopSettingsBuilder::default()
    }
}

#[derive(Debug, Default)]
struct LoopState {
    allocator: PipelineAllocator,
    // Nodes that must receive their full desired state on the next pass.
    out_of_sync: BTreeSet<NodeId>,
    known_nodes: BTreeSet<NodeId>,
}

/// Drives rebalancing for a whole cluster. Only one control loop should run per cluster.
#[derive(Debug)]
pub struct ControlLoop {
    registry: Arc<SourceRegistry>,
    membership: ClusterMembership,
    settings: ControlLoopSettings,
    state: Mutex<LoopState>,
    assignment: watch::Sender<Assignment>,
}

impl ControlLoop {
    pub fn new(
        registry: Arc<SourceRegistry>,
        membership: ClusterMembership,
        settings: ControlLoopSettings,
    ) -> Self {
        let (assignment, _) = watch::channel(Assignment::default());
        Self {
            registry,
            membership,
            settings,
            state: Mutex::new(LoopState::default()),
            assignment,
        }
    }

    /// Published after every reconcile pass.
    pub fn subscribe(&self) -> watch::Receiver<Assignment> {
        self.assignment.subscribe()
    }

    pub fn assignment(&self) -> Assignment {
        self.assignment.borrow().clone()
    }

    /// Recomputes the assignment and dispatches the resulting instructions.
    ///
    /// Dispatch failures are logged and repaired on a later pass; they never fail the reconcile.
    #[tracing::instrument(skip_all)]
    pub async fn reconcile(&self) -> Rebalance {
        let sources = self.registry.enabled_sources().await;
        let clients = self.membership.clients();
        let node_ids: Vec<NodeId> = clients.keys().cloned().collect();

        let mut state = self.state.lock().await;
        let previous = state.allocator.current().clone();
        let rebalance = state.allocator.rebalance(&sources, &node_ids);

        // Nodes we have never talked to may still run pipelines from an earlier life.
        let joined: Vec<NodeId> = node_ids
            .iter()
            .filter(|node_id| !state.known_nodes.contains(*node_id))
            .cloned()
            .collect();
        state.out_of_sync.extend(joined);
        state.known_nodes = node_ids.iter().cloned().collect();
        state.out_of_sync.retain(|node_id| clients.contains_key(node_id));

        let configs: BTreeMap<&SourceId, &SourceConfig> = sources
            .iter()
            .map(|config| (&config.source_id, config))
            .collect();

        let mut stops = Vec::new();
        for (node_id, client) in &clients {
            let message = if state.out_of_sync.contains(node_id) {
                let keep = rebalance.assignment.pipelines_for_node(node_id);
                Dispatch::Retain(keep.into_iter().collect())
            } else {
                let instructions: Vec<Instruction> = rebalance
                    .plan
                    .get(node_id)
                    .into_iter()
                    .flatten()
                    .filter(|instruction| instruction.is_stop())
                    .cloned()
                    .collect();
                if instructions.is_empty() {
                    continue;
                }
                Dispatch::Apply(instructions)
            };
            stops.push(self.dispatch(node_id.clone(), client.clone(), message));
        }

        let mut unconfirmed = BTreeSet::new();
        let mut held_back: BTreeSet<SourceId> = BTreeSet::new();
        for (node_id, result) in join_all(stops).await {
            if let Err(err) = result {
                tracing::warn!(%node_id, error = %format!("{err:#}"), "failed to stop pipelines, node will be resynced");
                let keep = rebalance.assignment.pipelines_for_node(&node_id);
                held_back.extend(
                    previous
                        .pipelines_for_node(&node_id)
                        .into_iter()
                        .filter(|pipeline_id| !keep.contains(pipeline_id))
                        .map(|pipeline_id| pipeline_id.source_id),
                );
                unconfirmed.insert(node_id);
            }
        }

        let mut deferred = BTreeSet::new();
        let mut starts = Vec::new();
        for (node_id, client) in &clients {
            if unconfirmed.contains(node_id) {
                continue;
            }
            let candidates: Vec<Instruction> = if state.out_of_sync.contains(node_id) {
                rebalance
                    .assignment
                    .pipelines_for_node(node_id)
                    .into_iter()
                    .filter_map(|pipeline_id| {
                        configs
                            .get(&pipeline_id.source_id)
                            .map(|config| Instruction::Start {
                                pipeline_id,
                                config: (*config).clone(),
                            })
                    })
                    .collect()
            } else {
                rebalance
                    .plan
                    .get(node_id)
                    .into_iter()
                    .flatten()
                    .filter(|instruction| instruction.is_start())
                    .cloned()
                    .collect()
            };

            let mut instructions = Vec::with_capacity(candidates.len());
            for instruction in candidates {
                if held_back.contains(&instruction.pipeline_id().source_id) {
                    tracing::info!(%node_id, pipeline_id = %instruction.pipeline_id(), "holding back start until the previous owner confirms its stop");
                    deferred.insert(node_id.clone());
                } else {
                    instructions.push(instruction);
                }
            }
            if instructions.is_empty() {
                continue;
            }
            starts.push(self.dispatch(
                node_id.clone(),
                client.clone(),
                Dispatch::Apply(instructions),
            ));
        }

        for (node_id, result) in join_all(starts).await {
            if let Err(err) = result {
                tracing::warn!(%node_id, error = %format!("{err:#}"), "failed to start pipelines, node will be resynced");
                unconfirmed.insert(node_id);
            }
        }

        let mut out_of_sync = unconfirmed;
        out_of_sync.extend(deferred);
        state.out_of_sync = out_of_sync;
        drop(state);

        self.assignment.send_if_modified(|assignment| {
            if *assignment == rebalance.assignment {
                return false;
            }
            *assignment = rebalance.assignment.clone();
            true
        });
        rebalance
    }

    async fn dispatch(
        &self,
        node_id: NodeId,
        client: Arc<dyn NodeClient>,
        message: Dispatch,
    ) -> (NodeId, anyhow::Result<()>) {
        let timeout = self.settings.dispatch_timeout;
        let send = async {
            match message {
                Dispatch::Apply(instructions) => {
                    tracing::debug!(%node_id, num_instructions = instructions.len(), "applying plan");
                    client.apply(instructions).await
                }
                Dispatch::Retain(keep) => {
                    tracing::debug!(%node_id, num_pipelines = keep.len(), "retaining desired pipelines");
                    client.retain(keep).await
                }
            }
        };
        let result = match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("node did not answer within {timeout:?}")),
        };
        (node_id, result)
    }

    /// Reconciles on every registry or membership change and on a fixed interval, until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut registry_changes = self.registry.subscribe();
        let mut membership_changes = self.membership.subscribe();
        let mut resync = tokio::time::interval(self.settings.resync_interval);

        tracing::info!("control loop started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = resync.tick() => {}
                Ok(()) = registry_changes.changed() => {}
                Ok(()) = membership_changes.changed() => {}
            }
            let rebalance = self.reconcile().await;
            if !rebalance.is_noop() {
                tracing::info!(
                    version = rebalance.assignment.version(),
                    num_nodes = rebalance.plan.len(),
                    "rebalanced pipelines"
                );
            }
        }
        tracing::info!("control loop stopped");
    }
}

#[derive(Debug)]
enum Dispatch {
    Apply(Vec<Instruction>),
    Retain(Vec<PipelineId>),
}
