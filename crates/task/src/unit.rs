//! Work unit declarations

use crate::action::WorkAction;
use kiln_core::{FileCollection, Implementation, InputProperty, OutputLocation, WorkUnitId};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Predicate deciding whether a unit runs at all
pub type Precondition = Arc<dyn Fn(&WorkUnit) -> bool + Send + Sync>;

/// A sealed, immutable unit of work.
///
/// Produced by [`WorkGraphBuilder::seal`](crate::WorkGraphBuilder::seal) from
/// a [`WorkUnitBuilder`]; property names are unique and validated.
pub struct WorkUnit {
    pub(crate) id: WorkUnitId,
    pub(crate) inputs: BTreeMap<String, InputProperty>,
    pub(crate) outputs: BTreeMap<String, OutputLocation>,
    pub(crate) dependencies: Vec<WorkUnitId>,
    pub(crate) action: Arc<dyn WorkAction>,
    pub(crate) implementation: Implementation,
    pub(crate) cacheable: bool,
    pub(crate) overlapping_outputs: bool,
    pub(crate) preconditions: Vec<Precondition>,
}

impl WorkUnit {
    /// Start declaring a unit with the given identity and action
    pub fn builder(
        id: impl Into<WorkUnitId>,
        action: impl WorkAction + 'static,
    ) -> WorkUnitBuilder {
        WorkUnitBuilder::new(id, Arc::new(action))
    }

    pub fn id(&self) -> &WorkUnitId {
        &self.id
    }

    pub fn inputs(&self) -> &BTreeMap<String, InputProperty> {
        &self.inputs
    }

    pub fn outputs(&self) -> &BTreeMap<String, OutputLocation> {
        &self.outputs
    }

    pub fn output(&self, name: &str) -> Option<&OutputLocation> {
        self.outputs.get(name)
    }

    /// Declared dependencies, in declaration order
    pub fn dependencies(&self) -> &[WorkUnitId] {
        &self.dependencies
    }

    pub fn action(&self) -> &Arc<dyn WorkAction> {
        &self.action
    }

    /// Implementation identity, captured once at seal time
    pub fn implementation(&self) -> &Implementation {
        &self.implementation
    }

    /// Whether results may be loaded from or stored to the build cache.
    /// Units without outputs have nothing to cache.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable && !self.overlapping_outputs && !self.outputs.is_empty()
    }

    /// Whether an output of this unit overlaps an output of another unit
    pub fn has_overlapping_outputs(&self) -> bool {
        self.overlapping_outputs
    }

    /// True when every declared precondition holds. Checked right before
    /// the unit would be evaluated, after its dependencies finished.
    pub fn preconditions_met(&self) -> bool {
        self.preconditions.iter().all(|precondition| precondition(self))
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("dependencies", &self.dependencies)
            .field("implementation", &self.implementation)
            .field("cacheable", &self.cacheable)
            .field("overlapping_outputs", &self.overlapping_outputs)
            .field("preconditions", &self.preconditions.len())
            .finish_non_exhaustive()
    }
}

/// Mutable declaration of a work unit, validated when the graph is sealed
pub struct WorkUnitBuilder {
    pub(crate) id: WorkUnitId,
    pub(crate) inputs: Vec<(String, InputProperty)>,
    pub(crate) outputs: Vec<(String, OutputLocation)>,
    pub(crate) dependencies: Vec<WorkUnitId>,
    pub(crate) action: Arc<dyn WorkAction>,
    pub(crate) cacheable: bool,
    pub(crate) preconditions: Vec<Precondition>,
}

impl WorkUnitBuilder {
    pub fn new(id: impl Into<WorkUnitId>, action: Arc<dyn WorkAction>) -> Self {
        Self {
            id: id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            dependencies: Vec::new(),
            action,
            cacheable: true,
            preconditions: Vec::new(),
        }
    }

    pub fn id(&self) -> &WorkUnitId {
        &self.id
    }

    #[must_use]
    pub fn input(mut self, name: impl Into<String>, property: InputProperty) -> Self {
        self.inputs.push((name.into(), property));
        self
    }

    #[must_use]
    pub fn input_files(self, name: impl Into<String>, files: FileCollection) -> Self {
        self.input(name, InputProperty::Files(files))
    }

    #[must_use]
    pub fn input_value(self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.input(name, InputProperty::Value(value.into()))
    }

    #[must_use]
    pub fn output(mut self, name: impl Into<String>, location: OutputLocation) -> Self {
        self.outputs.push((name.into(), location));
        self
    }

    #[must_use]
    pub fn output_file(self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.output(name, OutputLocation::file(path))
    }

    #[must_use]
    pub fn output_dir(self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.output(name, OutputLocation::directory(path))
    }

    #[must_use]
    pub fn depends_on(mut self, dependency: impl Into<WorkUnitId>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Opt out of the build cache, e.g. for non-deterministic outputs
    #[must_use]
    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Only run the unit when `precondition` holds.
    ///
    /// A unit whose precondition fails ends as skipped and its dependents
    /// still run. Several preconditions must all hold.
    #[must_use]
    pub fn only_if<F>(mut self, precondition: F) -> Self
    where
        F: Fn(&WorkUnit) -> bool + Send + Sync + 'static,
    {
        self.preconditions.push(Arc::new(precondition));
        self
    }
}

impl fmt::Debug for WorkUnitBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnitBuilder")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("dependencies", &self.dependencies)
            .field("cacheable", &self.cacheable)
            .field("preconditions", &self.preconditions.len())
            .finish_non_exhaustive()
    }
}
