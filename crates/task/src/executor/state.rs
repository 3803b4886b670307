//! Per-invocation state table, owned by the coordinator

use crate::graph::WorkGraph;
use crate::report::UnitReport;
use kiln_core::{
    ContentHash, ExecutionOutcome, FailureCause, OutcomeCounts, SkipReason, WorkUnitId,
};
use petgraph::graph::NodeIndex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    Pending,
    Ready,
    Running { started: Instant },
    Finished,
}

#[derive(Debug)]
struct NodeSlot {
    state: NodeState,
    /// Dependencies that have not finished yet
    remaining: usize,
    outcome: Option<ExecutionOutcome>,
    duration: Duration,
    output_hash: Option<ContentHash>,
    failure: Option<FailureCause>,
    skip_reason: Option<SkipReason>,
}

/// Finished dependency as seen by a dependent about to run
pub(crate) struct DependencyResult<'a> {
    pub id: &'a WorkUnitId,
    pub outcome: ExecutionOutcome,
    pub output_hash: &'a ContentHash,
}

pub(crate) struct SchedulerState<'g> {
    graph: &'g WorkGraph,
    slots: Vec<NodeSlot>,
    /// Ordered by node index, which is declaration order
    ready: BTreeSet<NodeIndex>,
    counts: OutcomeCounts,
}

impl<'g> SchedulerState<'g> {
    pub fn new(graph: &'g WorkGraph) -> Self {
        let mut ready = BTreeSet::new();
        let slots = graph
            .node_indices()
            .map(|node| {
                let remaining = graph.dependency_nodes(node).count();
                let state = if remaining == 0 {
                    ready.insert(node);
                    NodeState::Ready
                } else {
                    NodeState::Pending
                };
                NodeSlot {
                    state,
                    remaining,
                    outcome: None,
                    duration: Duration::ZERO,
                    output_hash: None,
                    failure: None,
                    skip_reason: None,
                }
            })
            .collect();
        Self {
            graph,
            slots,
            ready,
            counts: OutcomeCounts::default(),
        }
    }

    fn slot(&self, node: NodeIndex) -> &NodeSlot {
        &self.slots[node.index()]
    }

    fn slot_mut(&mut self, node: NodeIndex) -> &mut NodeSlot {
        &mut self.slots[node.index()]
    }

    pub fn id(&self, node: NodeIndex) -> &'g WorkUnitId {
        self.graph.node(node).id()
    }

    pub fn counts(&self) -> OutcomeCounts {
        self.counts
    }

    /// Next ready unit in declaration order
    pub fn pop_ready(&mut self) -> Option<NodeIndex> {
        self.ready.pop_first()
    }

    pub fn mark_running(&mut self, node: NodeIndex) {
        self.slot_mut(node).state = NodeState::Running {
            started: Instant::now(),
        };
    }

    pub fn elapsed(&self, node: NodeIndex) -> Duration {
        match self.slot(node).state {
            NodeState::Running { started } => started.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn running(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&node| matches!(self.slot(node).state, NodeState::Running { .. }))
            .collect()
    }

    pub fn dependency_results(&self, node: NodeIndex) -> Vec<DependencyResult<'_>> {
        let graph = self.graph;
        graph
            .dependency_nodes(node)
            .filter_map(|dependency| {
                let slot = self.slot(dependency);
                Some(DependencyResult {
                    id: graph.node(dependency).id(),
                    outcome: slot.outcome?,
                    output_hash: slot.output_hash.as_ref()?,
                })
            })
            .collect()
    }

    /// Record a successful outcome and release dependents whose last
    /// dependency this was
    pub fn complete(
        &mut self,
        node: NodeIndex,
        outcome: ExecutionOutcome,
        output_hash: ContentHash,
        duration: Duration,
    ) {
        self.finish(node, outcome, duration);
        self.slot_mut(node).output_hash = Some(output_hash);
        self.release_dependents(node);
    }

    /// Skip a unit that declined to run without holding back its
    /// dependents. It contributes no output hash to their upstream digest.
    pub fn pass(&mut self, node: NodeIndex, reason: SkipReason) {
        self.finish(node, ExecutionOutcome::Skipped, Duration::ZERO);
        self.slot_mut(node).skip_reason = Some(reason);
        self.release_dependents(node);
    }

    fn release_dependents(&mut self, node: NodeIndex) {
        let dependents: Vec<NodeIndex> = self.graph.dependent_nodes(node).collect();
        for dependent in dependents {
            let slot = &mut self.slots[dependent.index()];
            slot.remaining = slot.remaining.saturating_sub(1);
            if slot.remaining == 0 && slot.state == NodeState::Pending {
                slot.state = NodeState::Ready;
                self.ready.insert(dependent);
            }
        }
    }

    pub fn fail(&mut self, node: NodeIndex, cause: FailureCause, duration: Duration) {
        self.finish(node, ExecutionOutcome::Failed, duration);
        self.slot_mut(node).failure = Some(cause);
    }

    fn finish(&mut self, node: NodeIndex, outcome: ExecutionOutcome, duration: Duration) {
        let slot = self.slot_mut(node);
        slot.state = NodeState::Finished;
        slot.outcome = Some(outcome);
        slot.duration = duration;
        self.counts.record(outcome);
    }

    fn is_waiting(&self, node: NodeIndex) -> bool {
        matches!(self.slot(node).state, NodeState::Pending | NodeState::Ready)
    }

    pub fn skip(&mut self, node: NodeIndex, reason: SkipReason) {
        self.ready.remove(&node);
        self.finish(node, ExecutionOutcome::Skipped, Duration::ZERO);
        self.slot_mut(node).skip_reason = Some(reason);
    }

    /// Skip every unit that transitively depends on the unsuccessful `node`
    pub fn skip_dependents(&mut self, node: NodeIndex) -> Vec<(NodeIndex, SkipReason)> {
        let mut skipped = Vec::new();
        let mut queue = VecDeque::from([node]);
        while let Some(current) = queue.pop_front() {
            let failed = self.slot(current).outcome == Some(ExecutionOutcome::Failed);
            let dependents: Vec<NodeIndex> = self.graph.dependent_nodes(current).collect();
            for dependent in dependents {
                if !self.is_waiting(dependent) {
                    continue;
                }
                let dependency = self.id(current).clone();
                let reason = if failed {
                    SkipReason::DependencyFailed { dependency }
                } else {
                    SkipReason::DependencySkipped { dependency }
                };
                self.skip(dependent, reason.clone());
                skipped.push((dependent, reason));
                queue.push_back(dependent);
            }
        }
        skipped
    }

    /// Skip every unit that has not started yet
    pub fn skip_waiting(&mut self, reason: &SkipReason) -> Vec<(NodeIndex, SkipReason)> {
        let waiting: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&node| self.is_waiting(node))
            .collect();
        waiting
            .into_iter()
            .map(|node| {
                self.skip(node, reason.clone());
                (node, reason.clone())
            })
            .collect()
    }

    /// Reports for every unit, in declaration order
    pub fn into_reports(self) -> Vec<UnitReport> {
        let graph = self.graph;
        graph
            .node_indices()
            .zip(self.slots)
            .map(|(node, slot)| UnitReport {
                unit: graph.node(node).id().clone(),
                outcome: slot.outcome.unwrap_or(ExecutionOutcome::Skipped),
                duration: slot.duration,
                failure: slot.failure,
                skip_reason: slot.skip_reason,
            })
            .collect()
    }
}

/// Digest over the identity and output fingerprint of every dependency
pub(crate) fn upstream_digest(dependencies: &[DependencyResult<'_>]) -> ContentHash {
    let mut sorted: Vec<&DependencyResult<'_>> = dependencies.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(b.id));

    let mut hasher = Sha256::new();
    for dependency in sorted {
        for field in [dependency.id.as_str(), dependency.output_hash.as_str()] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
    }
    ContentHash::finish(hasher)
}
