//! Dependency graph of work units.
//!
//! Built in two phases: a [`WorkGraphBuilder`] collects declarations, then
//! [`WorkGraphBuilder::seal`] validates them and freezes an immutable
//! [`WorkGraph`]. Edges point from a unit to each of its dependencies.

use crate::unit::{WorkUnit, WorkUnitBuilder};
use kiln_core::{GraphError, WorkUnitId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::{algo, Direction};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Collects unit declarations during the configuration phase
#[derive(Debug, Default)]
pub struct WorkGraphBuilder {
    units: Vec<WorkUnitBuilder>,
}

impl WorkGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, unit: WorkUnitBuilder) -> &mut Self {
        self.units.push(unit);
        self
    }

    #[must_use]
    pub fn with(mut self, unit: WorkUnitBuilder) -> Self {
        self.units.push(unit);
        self
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Validate every declaration and freeze the graph.
    ///
    /// Fails on empty or duplicate identities, invalid property names,
    /// unknown or self dependencies, and cycles. Units whose outputs overlap
    /// another unit's outputs are marked non-cacheable.
    pub fn seal(self) -> Result<WorkGraph, GraphError> {
        let mut seen = HashSet::new();
        let mut units = Vec::with_capacity(self.units.len());
        for declared in self.units {
            if declared.id.is_empty() {
                return Err(GraphError::EmptyIdentity);
            }
            if !seen.insert(declared.id.clone()) {
                return Err(GraphError::DuplicateUnit(declared.id));
            }
            units.push(seal_unit(declared)?);
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for unit in units {
            let id = unit.id.clone();
            index.insert(id, graph.add_node(unit));
        }

        let mut edges = Vec::new();
        for node in graph.node_indices() {
            let unit: &WorkUnit = &graph[node];
            for dependency in &unit.dependencies {
                if *dependency == unit.id {
                    return Err(GraphError::SelfDependency(unit.id.clone()));
                }
                let Some(&target) = index.get(dependency) else {
                    return Err(GraphError::UnknownDependency {
                        unit: unit.id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                edges.push((node, target));
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(GraphError::Cycle(cycle));
        }
        mark_overlapping_outputs(&mut graph);

        let (nodes, edges) = graph.into_nodes_edges();
        let mut sealed = DiGraph::with_capacity(nodes.len(), edges.len());
        for node in nodes {
            sealed.add_node(Arc::new(node.weight));
        }
        for edge in edges {
            sealed.add_edge(edge.source(), edge.target(), ());
        }
        debug!(units = sealed.node_count(), edges = sealed.edge_count(), "Work graph sealed");
        Ok(WorkGraph {
            graph: sealed,
            index,
        })
    }
}

fn seal_unit(declared: WorkUnitBuilder) -> Result<WorkUnit, GraphError> {
    let inputs = unique_properties(&declared.id, "input", declared.inputs)?;
    let outputs = unique_properties(&declared.id, "output", declared.outputs)?;

    let mut seen = HashSet::new();
    let dependencies = declared
        .dependencies
        .into_iter()
        .filter(|dependency| seen.insert(dependency.clone()))
        .collect();

    Ok(WorkUnit {
        implementation: declared.action.implementation(),
        id: declared.id,
        inputs,
        outputs,
        dependencies,
        action: declared.action,
        cacheable: declared.cacheable,
        overlapping_outputs: false,
        preconditions: declared.preconditions,
    })
}

fn unique_properties<T>(
    unit: &WorkUnitId,
    kind: &'static str,
    declared: Vec<(String, T)>,
) -> Result<BTreeMap<String, T>, GraphError> {
    let invalid = |property: &str, reason: &str| GraphError::InvalidProperty {
        unit: unit.clone(),
        kind,
        property: property.to_string(),
        reason: reason.to_string(),
    };

    let mut properties = BTreeMap::new();
    for (name, value) in declared {
        if name.is_empty() {
            return Err(invalid(&name, "property names must not be empty"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(invalid(
                &name,
                "property names may only contain ASCII letters, digits, '_', '-' and '.'",
            ));
        }
        if properties.contains_key(&name) {
            return Err(invalid(&name, "declared more than once"));
        }
        properties.insert(name, value);
    }
    Ok(properties)
}

/// Path of the first cycle in declaration order, closed on its first unit
fn find_cycle(graph: &DiGraph<WorkUnit, ()>) -> Option<Vec<WorkUnitId>> {
    if !algo::is_cyclic_directed(graph) {
        return None;
    }
    let component = algo::tarjan_scc(graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .min_by_key(|component| component.iter().min().copied())?;
    let members: HashSet<NodeIndex> = component.iter().copied().collect();
    let start = component.iter().min().copied()?;

    // Breadth-first search back to `start` inside the component
    let mut parents: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        let mut successors: Vec<NodeIndex> = graph
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|next| members.contains(next))
            .collect();
        successors.sort();
        for next in successors {
            if next == start {
                let mut path = vec![graph[start].id.clone()];
                let mut cursor = node;
                let mut reversed = Vec::new();
                while cursor != start {
                    reversed.push(graph[cursor].id.clone());
                    cursor = *parents.get(&cursor)?;
                }
                path.extend(reversed.into_iter().rev());
                path.push(graph[start].id.clone());
                return Some(path);
            }
            if let std::collections::hash_map::Entry::Vacant(entry) = parents.entry(next) {
                entry.insert(node);
                queue.push_back(next);
            }
        }
    }
    None
}

fn mark_overlapping_outputs(graph: &mut DiGraph<WorkUnit, ()>) {
    let nodes: Vec<NodeIndex> = graph.node_indices().collect();
    let mut overlapping = BTreeSet::new();

    for (position, &a) in nodes.iter().enumerate() {
        for &b in &nodes[position + 1..] {
            for (name_a, location_a) in &graph[a].outputs {
                for (name_b, location_b) in &graph[b].outputs {
                    if location_a.overlaps(location_b) {
                        warn!(
                            "Outputs '{}.{name_a}' ({}) and '{}.{name_b}' ({}) overlap; \
                             both units are excluded from the build cache",
                            graph[a].id,
                            location_a.path.display(),
                            graph[b].id,
                            location_b.path.display(),
                        );
                        overlapping.insert(a);
                        overlapping.insert(b);
                    }
                }
            }
        }
    }

    for node in overlapping {
        graph[node].overlapping_outputs = true;
    }
}

/// Immutable, validated dependency graph for one invocation
#[derive(Debug, Clone)]
pub struct WorkGraph {
    graph: DiGraph<Arc<WorkUnit>, ()>,
    index: HashMap<WorkUnitId, NodeIndex>,
}

impl WorkGraph {
    pub fn builder() -> WorkGraphBuilder {
        WorkGraphBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Units in declaration order
    pub fn units(&self) -> impl Iterator<Item = &Arc<WorkUnit>> {
        self.graph.node_indices().map(|node| &self.graph[node])
    }

    pub fn unit(&self, id: &str) -> Option<&Arc<WorkUnit>> {
        self.index.get(id).map(|&node| &self.graph[node])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Direct dependencies of `id`, in declaration order
    pub fn dependencies(&self, id: &str) -> Option<Vec<&WorkUnitId>> {
        let node = *self.index.get(id)?;
        Some(self.dependency_nodes(node).map(|dep| &self.graph[dep].id).collect())
    }

    /// Units that directly depend on `id`, in declaration order
    pub fn dependents(&self, id: &str) -> Option<Vec<&WorkUnitId>> {
        let node = *self.index.get(id)?;
        Some(self.dependent_nodes(node).map(|dep| &self.graph[dep].id).collect())
    }

    /// Units no other unit depends on
    pub fn roots(&self) -> Vec<&WorkUnitId> {
        self.graph
            .node_indices()
            .filter(|&node| {
                self.graph
                    .edges_directed(node, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|node| &self.graph[node].id)
            .collect()
    }

    /// Restrict the graph to `targets` and everything they transitively depend on
    pub fn filtered(&self, targets: &[WorkUnitId]) -> Result<WorkGraph, GraphError> {
        if targets.is_empty() {
            return Err(GraphError::EmptyRequest);
        }
        let mut keep = HashSet::new();
        for target in targets {
            let &start = self
                .index
                .get(target)
                .ok_or_else(|| GraphError::UnknownTarget(target.clone()))?;
            let mut dfs = Dfs::new(&self.graph, start);
            while let Some(node) = dfs.next(&self.graph) {
                keep.insert(node);
            }
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut remap = HashMap::new();
        for node in self.graph.node_indices().filter(|node| keep.contains(node)) {
            let unit = Arc::clone(&self.graph[node]);
            let id = unit.id.clone();
            let new_node = graph.add_node(unit);
            index.insert(id, new_node);
            remap.insert(node, new_node);
        }
        for edge in self.graph.edge_references() {
            let (Some(&from), Some(&to)) = (remap.get(&edge.source()), remap.get(&edge.target()))
            else {
                continue;
            };
            graph.add_edge(from, to, ());
        }
        Ok(WorkGraph { graph, index })
    }

    /// Groups of units that could run in parallel, dependencies first.
    ///
    /// Only used for diagnostics; the scheduler releases units as soon as
    /// their own dependencies finish rather than level by level.
    pub fn execution_levels(&self) -> Vec<Vec<WorkUnitId>> {
        let mut levels = Vec::new();
        let mut remaining: BTreeSet<NodeIndex> = self.graph.node_indices().collect();

        while !remaining.is_empty() {
            let level: Vec<NodeIndex> = remaining
                .iter()
                .copied()
                .filter(|&node| self.dependency_nodes(node).all(|dep| !remaining.contains(&dep)))
                .collect();
            if level.is_empty() {
                break;
            }
            for node in &level {
                remaining.remove(node);
            }
            levels.push(level.into_iter().map(|node| self.graph[node].id.clone()).collect());
        }
        levels
    }

    pub(crate) fn node_indices(&self) -> impl Iterator<Item = NodeIndex> {
        self.graph.node_indices()
    }

    pub(crate) fn node(&self, node: NodeIndex) -> &Arc<WorkUnit> {
        &self.graph[node]
    }

    pub(crate) fn dependency_nodes(&self, node: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        let mut nodes: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        nodes.sort();
        nodes.into_iter()
    }

    pub(crate) fn dependent_nodes(&self, node: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        let mut nodes: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        nodes.sort();
        nodes.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionOutput, FnAction};
    use kiln_core::{ActionError, Implementation};

    fn unit(id: &str) -> WorkUnitBuilder {
        WorkUnit::builder(
            id,
            FnAction::new(Implementation::new("noop", "1"), |_| async {
                Ok::<_, ActionError>(ActionOutput::new())
            }),
        )
    }

    fn ids(units: Vec<&WorkUnitId>) -> Vec<&str> {
        units.into_iter().map(WorkUnitId::as_str).collect()
    }

    #[test]
    fn test_seal_keeps_declaration_order_and_edges() {
        let graph = WorkGraph::builder()
            .with(unit("a"))
            .with(unit("b"))
            .with(unit("c").depends_on("a").depends_on("b").depends_on("a"))
            .seal()
            .unwrap();

        let order: Vec<&str> = graph.units().map(|u| u.id().as_str()).collect();
        assert_eq!(order, ["a", "b", "c"]);
        assert_eq!(ids(graph.dependencies("c").unwrap()), ["a", "b"]);
        assert_eq!(ids(graph.dependents("a").unwrap()), ["c"]);
        assert_eq!(ids(graph.roots()), ["c"]);
        assert_eq!(graph.unit("c").unwrap().dependencies().len(), 2);
    }

    #[test]
    fn test_invalid_declarations_are_rejected() {
        let err = WorkGraph::builder().with(unit("")).seal().unwrap_err();
        assert_eq!(err, GraphError::EmptyIdentity);

        let err = WorkGraph::builder()
            .with(unit("a"))
            .with(unit("a"))
            .seal()
            .unwrap_err();
        assert_eq!(err, GraphError::DuplicateUnit("a".into()));

        let err = WorkGraph::builder()
            .with(unit("a").depends_on("a"))
            .seal()
            .unwrap_err();
        assert_eq!(err, GraphError::SelfDependency("a".into()));

        let err = WorkGraph::builder()
            .with(unit("a").depends_on("missing"))
            .seal()
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                unit: "a".into(),
                dependency: "missing".into()
            }
        );
    }

    #[test]
    fn test_property_names_are_validated() {
        let err = WorkGraph::builder()
            .with(unit("a").input_value("level", 1).input_value("level", 2))
            .seal()
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::InvalidProperty { kind: "input", ref property, .. } if property == "level"
        ));

        let err = WorkGraph::builder()
            .with(unit("a").output_file("out/file", "/tmp/out"))
            .seal()
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidProperty { kind: "output", .. }));

        let err = WorkGraph::builder()
            .with(unit("a").output_file("", "/tmp/out"))
            .seal()
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidProperty { .. }));
    }

    #[test]
    fn test_cycle_is_reported_with_its_path() {
        let err = WorkGraph::builder()
            .with(unit("a").depends_on("c"))
            .with(unit("b").depends_on("a"))
            .with(unit("c").depends_on("b"))
            .with(unit("d"))
            .seal()
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle(vec!["a".into(), "c".into(), "b".into(), "a".into()])
        );
    }

    #[test]
    fn test_overlapping_outputs_disable_caching() {
        let graph = WorkGraph::builder()
            .with(unit("docs").output_dir("site", "/work/build/site"))
            .with(unit("api").output_file("index", "/work/build/site/api.html"))
            .with(unit("lib").output_file("jar", "/work/build/lib.jar"))
            .seal()
            .unwrap();

        assert!(!graph.unit("docs").unwrap().is_cacheable());
        assert!(!graph.unit("api").unwrap().is_cacheable());
        assert!(graph.unit("lib").unwrap().is_cacheable());
        assert!(graph.unit("api").unwrap().has_overlapping_outputs());
    }

    #[test]
    fn test_filtered_keeps_transitive_dependencies() {
        let graph = WorkGraph::builder()
            .with(unit("a"))
            .with(unit("b").depends_on("a"))
            .with(unit("c").depends_on("b"))
            .with(unit("d"))
            .seal()
            .unwrap();

        let filtered = graph.filtered(&["b".into()]).unwrap();
        let order: Vec<&str> = filtered.units().map(|u| u.id().as_str()).collect();
        assert_eq!(order, ["a", "b"]);
        assert_eq!(ids(filtered.dependencies("b").unwrap()), ["a"]);

        assert_eq!(
            graph.filtered(&["zzz".into()]).unwrap_err(),
            GraphError::UnknownTarget("zzz".into())
        );
        assert_eq!(graph.filtered(&[]).unwrap_err(), GraphError::EmptyRequest);
    }

    #[test]
    fn test_execution_levels() {
        let graph = WorkGraph::builder()
            .with(unit("a"))
            .with(unit("b"))
            .with(unit("c").depends_on("a").depends_on("b"))
            .with(unit("d").depends_on("c"))
            .seal()
            .unwrap();

        let levels: Vec<Vec<String>> = graph
            .execution_levels()
            .into_iter()
            .map(|level| level.into_iter().map(|id| id.to_string()).collect())
            .collect();
        assert_eq!(levels, vec![vec!["a", "b"], vec!["c"], vec!["d"]]);
    }
}
