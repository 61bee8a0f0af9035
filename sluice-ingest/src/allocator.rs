//! Decides how many pipelines run for each source and on which nodes.
//!
//! The allocator is a pure function of the enabled sources, the live nodes and the previous
//! assignment. Each source gets `T = min(desired, nodes * max_per_node)` pipelines, identified by
//! an ordinal in `0..T`. A pipeline with ordinal `i` reads the partitions that hash to bucket `i`
//! out of `T`, so every partition is read by exactly one pipeline.
//!
//! Placement keeps every pipeline of the previous assignment that still fits on a live node and
//! only places the remaining ones. Among eligible nodes the one with the fewest pipelines of the
//! source wins, then a node already running the source, then the node with the lowest load across
//! all sources, then the lowest node id.
//!
//! A change of `T` changes the partition subset of every pipeline of the source, so all of its
//! pipelines are restarted even when they stay on the same node.
//!
//! Sources fed through a node local queue (the ingest API) are the exception: they run one
//! pipeline `0of1` on every live node, and that pipeline reads whatever its own node lists.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::{Deserialize, Serialize};

use sluice_core::{NodeId, PartitionId, SourceConfig, SourceId, util::hash_bucket};

/// One pipeline of a source on a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PipelineId {
    pub source_id: SourceId,
    pub node_id: NodeId,
    pub pipeline_ord: usize,
    pub num_pipelines: usize,
}

impl PipelineId {
    /// Whether this pipeline is responsible for `partition_id`.
    pub fn owns_partition(&self, partition_id: &PartitionId) -> bool {
        hash_bucket(partition_id.as_str(), self.num_pipelines) == self.pipeline_ord
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}of{}",
            self.source_id, self.node_id, self.pipeline_ord, self.num_pipelines
        )
    }
}

/// Placement of the pipelines of one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAssignment {
    pub num_pipelines: usize,
    /// Pipeline ordinals per node. Nodes without pipelines are absent.
    pub nodes: BTreeMap<NodeId, BTreeSet<usize>>,
}

impl SourceAssignment {
    pub fn pipeline_count(&self, node_id: &str) -> usize {
        self.nodes.get(node_id).map_or(0, BTreeSet::len)
    }

    pub fn total(&self) -> usize {
        self.nodes.values().map(BTreeSet::len).sum()
    }
}

/// The allocator's view of what should run where.
///
/// Replaced wholesale on every recomputation; the version only moves when the content does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    version: u64,
    sources: BTreeMap<SourceId, SourceAssignment>,
}

impl Assignment {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceAssignment> {
        self.sources.get(source_id)
    }

    pub fn sources(&self) -> impl Iterator<Item = (&SourceId, &SourceAssignment)> {
        self.sources.iter()
    }

    /// `(node, pipeline count)` pairs of a source.
    pub fn pipeline_counts(&self, source_id: &str) -> Vec<(NodeId, usize)> {
        self.sources
            .get(source_id)
            .map(|source| {
                source
                    .nodes
                    .iter()
                    .map(|(node_id, ords)| (node_id.clone(), ords.len()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn total_pipelines(&self, source_id: &str) -> usize {
        self.sources.get(source_id).map_or(0, SourceAssignment::total)
    }

    /// Pipelines across all sources on a node.
    pub fn node_load(&self, node_id: &str) -> usize {
        self.sources
            .values()
            .map(|source| source.pipeline_count(node_id))
            .sum()
    }

    pub fn pipelines(&self) -> BTreeSet<PipelineId> {
        self.sources
            .iter()
            .flat_map(|(source_id, source)| {
                source.nodes.iter().flat_map(move |(node_id, ords)| {
                    ords.iter().map(move |&pipeline_ord| PipelineId {
                        source_id: source_id.clone(),
                        node_id: node_id.clone(),
                        pipeline_ord,
                        num_pipelines: source.num_pipelines,
                    })
                })
            })
            .collect()
    }

    pub fn pipelines_for_node(&self, node_id: &str) -> BTreeSet<PipelineId> {
        self.pipelines()
            .into_iter()
            .filter(|pipeline| pipeline.node_id == node_id)
            .collect()
    }
}

/// A source could not get all the pipelines it asked for. Not an error: the feasible ones run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityShortfall {
    pub source_id: SourceId,
    pub desired: usize,
    pub assigned: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Start {
        pipeline_id: PipelineId,
        config: SourceConfig,
    },
    Stop {
        pipeline_id: PipelineId,
    },
}

impl Instruction {
    pub fn pipeline_id(&self) -> &PipelineId {
        match self {
            Instruction::Start { pipeline_id, .. } | Instruction::Stop { pipeline_id } => {
                pipeline_id
            }
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, Instruction::Start { .. })
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Instruction::Stop { .. })
    }
}

/// Outcome of a recomputation.
#[derive(Debug, Clone, Default)]
pub struct Rebalance {
    pub assignment: Assignment,
    /// Instructions per node, stops before starts. Nodes without changes are absent.
    pub plan: BTreeMap<NodeId, Vec<Instruction>>,
    pub shortfalls: Vec<CapacityShortfall>,
}

impl Rebalance {
    pub fn is_noop(&self) -> bool {
        self.plan.is_empty()
    }
}

/// Holds the current assignment and moves it forward on every input change.
#[derive(Debug, Default)]
pub struct PipelineAllocator {
    current: Assignment,
}

impl PipelineAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &Assignment {
        &self.current
    }

    /// Recomputes the assignment from the enabled sources and live nodes and returns the delta.
    ///
    /// Disabled sources in `sources` are ignored. Duplicate node ids are merged.
    #[tracing::instrument(skip_all, fields(num_sources = sources.len(), num_nodes = nodes.len()))]
    pub fn rebalance(&mut self, sources: &[SourceConfig], nodes: &[NodeId]) -> Rebalance {
        let (assignment, shortfalls) = compute_assignment(sources, nodes, &self.current);

        for shortfall in &shortfalls {
            tracing::warn!(
                source_id = %shortfall.source_id,
                desired = shortfall.desired,
                assigned = shortfall.assigned,
                "not enough indexer capacity, running a partial set of pipelines"
            );
            #[cfg(feature = "metrics")]
            sluice_core::metrics::emit_capacity_shortfall(
                &shortfall.source_id,
                shortfall.desired - shortfall.assigned,
            );
        }

        let plan = diff(&self.current, &assignment, sources);
        if !plan.is_empty() {
            tracing::info!(
                version = assignment.version,
                num_nodes_affected = plan.len(),
                "rebalance computed"
            );
        }
        self.current = assignment.clone();

        Rebalance {
            assignment,
            plan,
            shortfalls,
        }
    }
}

struct SourceShape {
    num_pipelines: usize,
    per_node_quota: usize,
    desired: usize,
}

fn source_shape(config: &SourceConfig, num_nodes: usize) -> SourceShape {
    if config.source_type.runs_on_every_node() {
        return SourceShape {
            num_pipelines: usize::from(num_nodes > 0),
            per_node_quota: 1,
            desired: num_nodes,
        };
    }
    let desired = config.desired_num_pipelines();
    let max_per_node = config.max_num_pipelines_per_indexer();
    let num_pipelines = desired.min(num_nodes.saturating_mul(max_per_node));
    let per_node_quota = if num_nodes == 0 {
        0
    } else {
        num_pipelines.div_ceil(num_nodes).min(max_per_node)
    };
    SourceShape {
        num_pipelines,
        per_node_quota,
        desired,
    }
}

/// Computes the next assignment. Pure: identical inputs yield identical outputs.
pub fn compute_assignment(
    sources: &[SourceConfig],
    nodes: &[NodeId],
    previous: &Assignment,
) -> (Assignment, Vec<CapacityShortfall>) {
    let live_nodes: BTreeSet<&NodeId> = nodes.iter().collect();
    let mut enabled: Vec<&SourceConfig> = sources.iter().filter(|config| config.enabled).collect();
    enabled.sort_by(|left, right| left.source_id.cmp(&right.source_id));
    enabled.dedup_by(|left, right| left.source_id == right.source_id);

    let mut load: BTreeMap<&NodeId, usize> = live_nodes.iter().map(|&node| (node, 0)).collect();
    let mut shortfalls = Vec::new();

    // Keep what still fits first, so global load reflects surviving pipelines before anything
    // new is placed.
    let mut placements: Vec<(&SourceConfig, SourceShape, BTreeMap<NodeId, BTreeSet<usize>>)> =
        Vec::with_capacity(enabled.len());
    for config in enabled {
        let shape = source_shape(config, live_nodes.len());
        let mut kept: BTreeMap<NodeId, BTreeSet<usize>> = BTreeMap::new();
        if config.source_type.runs_on_every_node() && shape.num_pipelines > 0 {
            for &node_id in &live_nodes {
                kept.insert(node_id.clone(), BTreeSet::from([0]));
                if let Some(node_load) = load.get_mut(node_id) {
                    *node_load += 1;
                }
            }
        } else if let Some(prev) = previous.source(&config.source_id) {
            for (node_id, ords) in &prev.nodes {
                if !live_nodes.contains(node_id) {
                    continue;
                }
                let ords: BTreeSet<usize> = ords
                    .iter()
                    .copied()
                    .filter(|&ord| ord < shape.num_pipelines)
                    .take(shape.per_node_quota)
                    .collect();
                if ords.is_empty() {
                    continue;
                }
                if let Some(node_load) = load.get_mut(node_id) {
                    *node_load += ords.len();
                }
                kept.insert(node_id.clone(), ords);
            }
        }
        placements.push((config, shape, kept));
    }

    let mut next = BTreeMap::new();
    for (config, shape, mut nodes_for_source) in placements {
        let previous_nodes: BTreeSet<&NodeId> = previous
            .source(&config.source_id)
            .map(|prev| prev.nodes.keys().collect())
            .unwrap_or_default();
        let taken: BTreeSet<usize> = nodes_for_source.values().flatten().copied().collect();

        for ord in (0..shape.num_pipelines).filter(|ord| !taken.contains(ord)) {
            let chosen = live_nodes
                .iter()
                .map(|&node_id| {
                    let count = nodes_for_source.get(node_id).map_or(0, BTreeSet::len);
                    (node_id, count)
                })
                .filter(|&(_, count)| count < shape.per_node_quota)
                .min_by_key(|&(node_id, count)| {
                    (
                        count,
                        !previous_nodes.contains(node_id),
                        load.get(node_id).copied().unwrap_or_default(),
                        node_id,
                    )
                })
                .map(|(node_id, _)| node_id);

            // The quota guarantees room for every ordinal; nothing to place otherwise.
            let Some(node_id) = chosen else { break };
            nodes_for_source
                .entry(node_id.clone())
                .or_default()
                .insert(ord);
            if let Some(node_load) = load.get_mut(node_id) {
                *node_load += 1;
            }
        }

        let assignment = SourceAssignment {
            num_pipelines: shape.num_pipelines,
            nodes: nodes_for_source,
        };
        if assignment.total() < shape.desired {
            shortfalls.push(CapacityShortfall {
                source_id: config.source_id.clone(),
                desired: shape.desired,
                assigned: assignment.total(),
            });
        }
        if assignment.num_pipelines > 0 {
            next.insert(config.source_id.clone(), assignment);
        }
    }

    let version = if next == previous.sources {
        previous.version
    } else {
        previous.version + 1
    };
    (
        Assignment {
            version,
            sources: next,
        },
        shortfalls,
    )
}

/// Start and stop instructions turning `previous` into `next`, grouped by node.
pub fn diff(
    previous: &Assignment,
    next: &Assignment,
    sources: &[SourceConfig],
) -> BTreeMap<NodeId, Vec<Instruction>> {
    let configs: BTreeMap<&str, &SourceConfig> = sources
        .iter()
        .map(|config| (config.source_id.as_str(), config))
        .collect();
    let before = previous.pipelines();
    let after = next.pipelines();

    let mut plan: BTreeMap<NodeId, Vec<Instruction>> = BTreeMap::new();
    for pipeline_id in before.difference(&after) {
        plan.entry(pipeline_id.node_id.clone())
            .or_default()
            .push(Instruction::Stop {
                pipeline_id: pipeline_id.clone(),
            });
    }
    for pipeline_id in after.difference(&before) {
        let Some(config) = configs.get(pipeline_id.source_id.as_str()) else {
            continue;
        };
        plan.entry(pipeline_id.node_id.clone())
            .or_default()
            .push(Instruction::Start {
                pipeline_id: pipeline_id.clone(),
                config: (*config).clone(),
            });
    }
    plan
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sluice_core::test_utils::{file_source, void_source};
    use test_case::test_case;

    use super::*;

    fn nodes(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(ToString::to_string).collect()
    }

    #[test_case(2, 1, 3, 2 ; "desired below capacity")]
    #[test_case(1, 2, 1, 1 ; "desired caps below max")]
    #[test_case(5, 2, 2, 4 ; "capacity caps desired")]
    #[test_case(7, 3, 3, 7 ; "uneven spread")]
    #[test_case(3, 1, 0, 0 ; "no nodes")]
    fn test_total_pipelines(desired: usize, max: usize, num_nodes: usize, expected: usize) {
        let node_ids: Vec<NodeId> = (0..num_nodes).map(|i| format!("node-{i}")).collect();
        let source = void_source("source", desired, max);
        let (assignment, _) = compute_assignment(&[source], &node_ids, &Assignment::default());

        assert_eq!(assignment.total_pipelines("source"), expected);
        for (_, count) in assignment.pipeline_counts("source") {
            assert!(count <= max);
        }
    }

    #[test]
    fn test_spread_is_even() {
        let source = void_source("source", 7, 3);
        let (assignment, _) = compute_assignment(
            &[source],
            &nodes(&["a", "b", "c"]),
            &Assignment::default(),
        );
        assert_eq!(
            assignment.pipeline_counts("source"),
            vec![("a".into(), 3), ("b".into(), 2), ("c".into(), 2)]
        );
    }

    #[test]
    fn test_non_distributable_source_gets_exactly_one_pipeline() {
        let source = file_source("file-source");
        for num_nodes in 1..5 {
            let node_ids: Vec<NodeId> = (0..num_nodes).map(|i| format!("node-{i}")).collect();
            let (assignment, shortfalls) =
                compute_assignment(&[source.clone()], &node_ids, &Assignment::default());
            assert_eq!(
                assignment.pipeline_counts("file-source"),
                vec![("node-0".into(), 1)]
            );
            assert!(shortfalls.is_empty());
        }
    }

    #[test]
    fn test_non_distributable_source_stays_on_its_node() {
        let source = file_source("file-source");
        let (first, _) = compute_assignment(
            &[source.clone()],
            &nodes(&["b", "c"]),
            &Assignment::default(),
        );
        assert_eq!(first.pipeline_counts("file-source"), vec![("b".into(), 1)]);

        let (second, _) = compute_assignment(&[source], &nodes(&["a", "b", "c"]), &first);
        assert_eq!(second.pipeline_counts("file-source"), vec![("b".into(), 1)]);
        assert_eq!(second.version(), first.version());
    }

    #[test]
    fn test_rebalance_is_idempotent() {
        let sources = vec![
            void_source("alpha", 4, 2),
            void_source("beta", 3, 1),
            file_source("gamma"),
        ];
        let node_ids = nodes(&["a", "b", "c"]);
        let mut allocator = PipelineAllocator::new();

        let first = allocator.rebalance(&sources, &node_ids);
        assert!(!first.is_noop());
        let second = allocator.rebalance(&sources, &node_ids);

        assert!(second.is_noop());
        assert_eq!(first.assignment, second.assignment);
        assert_eq!(second.assignment.version(), 1);
    }

    #[test]
    fn test_global_load_breaks_ties() {
        let sources = vec![void_source("alpha", 1, 1), void_source("beta", 1, 1)];
        let (assignment, _) =
            compute_assignment(&sources, &nodes(&["a", "b"]), &Assignment::default());
        assert_eq!(assignment.pipeline_counts("alpha"), vec![("a".into(), 1)]);
        assert_eq!(assignment.pipeline_counts("beta"), vec![("b".into(), 1)]);
    }

    #[test]
    fn test_shortfall_is_reported() {
        let mut allocator = PipelineAllocator::new();
        let rebalance = allocator.rebalance(&[void_source("source", 5, 1)], &nodes(&["a", "b"]));
        assert_eq!(
            rebalance.shortfalls,
            vec![CapacityShortfall {
                source_id: "source".into(),
                desired: 5,
                assigned: 2,
            }]
        );
        assert_eq!(rebalance.assignment.total_pipelines("source"), 2);
    }

    #[test]
    fn test_disabled_sources_are_stopped() {
        let mut allocator = PipelineAllocator::new();
        let mut source = void_source("source", 2, 1);
        allocator.rebalance(&[source.clone()], &nodes(&["a", "b"]));

        source.enabled = false;
        let rebalance = allocator.rebalance(&[source], &nodes(&["a", "b"]));

        assert!(rebalance.assignment.source("source").is_none());
        let stops: Vec<&Instruction> = rebalance.plan.values().flatten().collect();
        assert_eq!(stops.len(), 2);
        assert!(stops.iter().all(|instruction| !instruction.is_start()));
    }

    #[test]
    fn test_unaffected_nodes_get_no_instructions() {
        let mut allocator = PipelineAllocator::new();
        let sources = vec![void_source("alpha", 1, 1), void_source("beta", 1, 1)];
        allocator.rebalance(&sources, &nodes(&["a", "b"]));

        // beta disappears, alpha stays on `a`
        let rebalance = allocator.rebalance(&sources[..1], &nodes(&["a", "b"]));
        assert_eq!(rebalance.plan.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_new_node_takes_over_one_pipeline() {
        let mut allocator = PipelineAllocator::new();
        allocator.rebalance(&[void_source("source", 2, 2)], &nodes(&["a"]));
        let rebalance = allocator.rebalance(&[void_source("source", 2, 2)], &nodes(&["a", "b"]));

        let pipeline = |node: &str, ord: usize| PipelineId {
            source_id: "source".into(),
            node_id: node.into(),
            pipeline_ord: ord,
            num_pipelines: 2,
        };
        assert_eq!(
            rebalance.plan["a"],
            vec![Instruction::Stop {
                pipeline_id: pipeline("a", 1)
            }]
        );
        assert_eq!(rebalance.plan["b"].len(), 1);
        assert_eq!(rebalance.plan["b"][0].pipeline_id(), &pipeline("b", 1));
    }

    #[test]
    fn test_changing_num_pipelines_restarts_the_source() {
        let mut allocator = PipelineAllocator::new();
        allocator.rebalance(&[void_source("source", 2, 2)], &nodes(&["a", "b"]));
        let rebalance = allocator.rebalance(&[void_source("source", 3, 2)], &nodes(&["a", "b"]));

        assert_eq!(
            rebalance.assignment.pipeline_counts("source"),
            vec![("a".into(), 2), ("b".into(), 1)]
        );
        // every old pipeline stops, every new one starts
        assert_eq!(rebalance.plan["a"].len(), 3);
        assert_eq!(rebalance.plan["b"].len(), 2);
        assert!(
            rebalance
                .plan
                .values()
                .flatten()
                .filter(|instruction| instruction.is_start())
                .all(|instruction| instruction.pipeline_id().num_pipelines == 3)
        );
    }

    #[test]
    fn test_each_partition_has_exactly_one_owner() {
        let (assignment, _) = compute_assignment(
            &[void_source("source", 4, 2)],
            &nodes(&["a", "b", "c"]),
            &Assignment::default(),
        );
        let pipelines = assignment.pipelines();
        for partition in 0..64_u64 {
            let partition_id = PartitionId::from(partition);
            let owners = pipelines
                .iter()
                .filter(|pipeline| pipeline.owns_partition(&partition_id))
                .count();
            assert_eq!(owners, 1, "partition {partition_id}");
        }
    }

    #[test]
    fn test_ingest_api_source_runs_once_on_every_node() {
        let ingest = SourceConfig::ingest_api_default();
        let source_id = ingest.source_id.clone();
        let mut allocator = PipelineAllocator::new();

        let first = allocator.rebalance(&[ingest.clone()], &nodes(&["a", "b", "c"]));
        assert_eq!(
            first.assignment.pipeline_counts(&source_id),
            vec![("a".into(), 1), ("b".into(), 1), ("c".into(), 1)]
        );
        assert!(first.shortfalls.is_empty());
        assert!(
            first
                .assignment
                .pipelines()
                .iter()
                .all(|pipeline| pipeline.pipeline_ord == 0 && pipeline.num_pipelines == 1)
        );

        // `b` leaves: the pipelines of `a` and `c` are left alone
        let second = allocator.rebalance(&[ingest.clone()], &nodes(&["a", "c"]));
        assert_eq!(second.plan.keys().collect::<Vec<_>>(), vec!["b"]);
        assert!(!second.plan["b"][0].is_start());

        let third = allocator.rebalance(&[ingest], &nodes(&["a", "c", "d"]));
        assert_eq!(third.plan.keys().collect::<Vec<_>>(), vec!["d"]);
        assert!(third.plan["d"][0].is_start());

        let (empty, _) = compute_assignment(
            &[SourceConfig::ingest_api_default()],
            &[],
            &Assignment::default(),
        );
        assert_eq!(empty.total_pipelines(&source_id), 0);
    }
}
