use crate::record::ExecutionHistoryRecord;
use kiln_core::{ContentHash, DependencyInvalidation, Implementation, WorkUnitId};
use kiln_fingerprint::{EntryKind, FileChange, Fingerprint};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Number of change reasons logged per unit before the rest are summarized
const MAX_LOGGED_CHANGES: usize = 10;

/// Why a unit is not up to date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum ChangeReason {
    NoHistory,
    RerunRequested,
    PreviousExecutionFailed,
    NoOutputsDeclared,
    ImplementationChanged {
        previous: Implementation,
        current: Implementation,
    },
    InputPropertyAdded {
        property: String,
    },
    InputPropertyRemoved {
        property: String,
    },
    InputValueChanged {
        property: String,
    },
    InputFileChanged {
        property: String,
        path: String,
        change: FileChange,
    },
    DependencyExecuted {
        dependency: WorkUnitId,
    },
    UpstreamChanged,
    OutputPropertiesChanged,
    OutputFileChanged {
        property: String,
        path: String,
        change: FileChange,
    },
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHistory => f.write_str("no history is available"),
            Self::RerunRequested => f.write_str("rerun was requested"),
            Self::PreviousExecutionFailed => f.write_str("previous execution failed"),
            Self::NoOutputsDeclared => f.write_str("no outputs are declared"),
            Self::ImplementationChanged { previous, current } => {
                write!(f, "implementation changed from {previous} to {current}")
            }
            Self::InputPropertyAdded { property } => {
                write!(f, "input property '{property}' was added")
            }
            Self::InputPropertyRemoved { property } => {
                write!(f, "input property '{property}' was removed")
            }
            Self::InputValueChanged { property } => {
                write!(f, "value of input property '{property}' changed")
            }
            Self::InputFileChanged {
                property,
                path,
                change,
            } => write!(f, "input file {path} of '{property}' was {change}"),
            Self::DependencyExecuted { dependency } => {
                write!(f, "dependency '{dependency}' was re-executed")
            }
            Self::UpstreamChanged => f.write_str("outputs of dependencies changed"),
            Self::OutputPropertiesChanged => f.write_str("declared output properties changed"),
            Self::OutputFileChanged {
                property,
                path,
                change,
            } => write!(f, "output file {path} of '{property}' was {change}"),
        }
    }
}

/// Result of an up-to-date check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpToDateStatus {
    UpToDate,
    OutOfDate(Vec<ChangeReason>),
    NoHistory,
}

impl UpToDateStatus {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Self::UpToDate)
    }

    /// Reasons the unit has to run; empty when up to date
    pub fn into_changes(self) -> Vec<ChangeReason> {
        match self {
            Self::UpToDate => Vec::new(),
            Self::OutOfDate(changes) => changes,
            Self::NoHistory => vec![ChangeReason::NoHistory],
        }
    }
}

/// Current state of a unit, gathered just before the check
#[derive(Debug, Clone, Copy)]
pub struct CurrentState<'a> {
    pub implementation: &'a Implementation,
    pub inputs: &'a BTreeMap<String, Fingerprint>,
    pub outputs: &'a BTreeMap<String, Fingerprint>,
    /// Digest over the dependencies' outputs, when dependencies are tracked
    pub upstream: Option<&'a ContentHash>,
    /// Dependencies that executed or loaded from cache in this invocation
    pub executed_dependencies: &'a [WorkUnitId],
}

/// Decides whether a unit can skip execution
#[derive(Debug, Clone, Copy, Default)]
pub struct UpToDateChecker {
    invalidation: DependencyInvalidation,
    rerun_all: bool,
}

impl UpToDateChecker {
    pub fn new(invalidation: DependencyInvalidation) -> Self {
        Self {
            invalidation,
            rerun_all: false,
        }
    }

    /// Treat every unit as out of date
    #[must_use]
    pub fn rerun_all(mut self, rerun_all: bool) -> Self {
        self.rerun_all = rerun_all;
        self
    }

    pub fn invalidation(&self) -> DependencyInvalidation {
        self.invalidation
    }

    /// Compare the current state against the last recorded execution.
    ///
    /// Every detected change is reported, in a fixed order: previous result,
    /// implementation, inputs (by property, then path), dependencies, outputs.
    pub fn check(
        &self,
        current: &CurrentState<'_>,
        history: Option<&ExecutionHistoryRecord>,
    ) -> UpToDateStatus {
        let Some(previous) = history else {
            return UpToDateStatus::NoHistory;
        };
        if self.rerun_all {
            return UpToDateStatus::OutOfDate(vec![ChangeReason::RerunRequested]);
        }

        let mut changes = Vec::new();

        if !previous.success {
            changes.push(ChangeReason::PreviousExecutionFailed);
        }
        if current.outputs.is_empty() {
            changes.push(ChangeReason::NoOutputsDeclared);
        }
        if previous.implementation != *current.implementation {
            changes.push(ChangeReason::ImplementationChanged {
                previous: previous.implementation.clone(),
                current: current.implementation.clone(),
            });
        }

        compare_inputs(current.inputs, &previous.inputs, &mut changes);
        self.compare_dependencies(current, previous, &mut changes);
        compare_outputs(current.outputs, &previous.outputs, &mut changes);

        if changes.is_empty() {
            UpToDateStatus::UpToDate
        } else {
            UpToDateStatus::OutOfDate(changes)
        }
    }

    /// Check and log the outcome for `unit`
    pub fn check_unit(
        &self,
        unit: &WorkUnitId,
        current: &CurrentState<'_>,
        history: Option<&ExecutionHistoryRecord>,
    ) -> UpToDateStatus {
        let status = self.check(current, history);
        match &status {
            UpToDateStatus::UpToDate => debug!(%unit, "Up to date"),
            UpToDateStatus::NoHistory => debug!(%unit, "Out of date: no history is available"),
            UpToDateStatus::OutOfDate(changes) => log_changes(unit, changes),
        }
        status
    }

    fn compare_dependencies(
        &self,
        current: &CurrentState<'_>,
        previous: &ExecutionHistoryRecord,
        changes: &mut Vec<ChangeReason>,
    ) {
        if self.invalidation == DependencyInvalidation::OnExecution {
            let executed: BTreeSet<&WorkUnitId> = current.executed_dependencies.iter().collect();
            changes.extend(executed.into_iter().map(|dependency| {
                ChangeReason::DependencyExecuted {
                    dependency: dependency.clone(),
                }
            }));
        }
        if self.invalidation.tracks_upstream() && previous.upstream.as_ref() != current.upstream {
            changes.push(ChangeReason::UpstreamChanged);
        }
    }
}

fn compare_inputs(
    current: &BTreeMap<String, Fingerprint>,
    previous: &BTreeMap<String, Fingerprint>,
    changes: &mut Vec<ChangeReason>,
) {
    let names: BTreeSet<&String> = current.keys().chain(previous.keys()).collect();
    for name in names {
        match (current.get(name), previous.get(name)) {
            (Some(_), None) => changes.push(ChangeReason::InputPropertyAdded {
                property: name.clone(),
            }),
            (None, Some(_)) => changes.push(ChangeReason::InputPropertyRemoved {
                property: name.clone(),
            }),
            (Some(now), Some(before)) if now != before => {
                if is_value(now) || is_value(before) {
                    changes.push(ChangeReason::InputValueChanged {
                        property: name.clone(),
                    });
                } else {
                    changes.extend(now.diff(before).into_iter().map(|change| {
                        ChangeReason::InputFileChanged {
                            property: name.clone(),
                            path: change.path,
                            change: change.change,
                        }
                    }));
                }
            }
            _ => {}
        }
    }
}

fn compare_outputs(
    current: &BTreeMap<String, Fingerprint>,
    previous: &BTreeMap<String, Fingerprint>,
    changes: &mut Vec<ChangeReason>,
) {
    if !current.keys().eq(previous.keys()) {
        changes.push(ChangeReason::OutputPropertiesChanged);
        return;
    }
    for (name, now) in current {
        if let Some(before) = previous.get(name) {
            changes.extend(now.diff(before).into_iter().map(|change| {
                ChangeReason::OutputFileChanged {
                    property: name.clone(),
                    path: change.path,
                    change: change.change,
                }
            }));
        }
    }
}

fn is_value(fingerprint: &Fingerprint) -> bool {
    fingerprint
        .entries()
        .any(|(_, entry)| entry.kind == EntryKind::Value)
}

/// Log why a unit is out of date, capped to keep diagnostics readable
fn log_changes(unit: &WorkUnitId, changes: &[ChangeReason]) {
    for change in changes.iter().take(MAX_LOGGED_CHANGES) {
        debug!(%unit, "Out of date: {change}");
    }
    if changes.len() > MAX_LOGGED_CHANGES {
        debug!(
            %unit,
            "Out of date: and {} more changes",
            changes.len() - MAX_LOGGED_CHANGES
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ExecutionOrigin;
    use kiln_core::{ExecutionOutcome, InvocationId};
    use kiln_fingerprint::FingerprintEntry;

    fn files(entries: &[(&str, &str)]) -> Fingerprint {
        let mut fingerprint = Fingerprint::new();
        for (path, content) in entries {
            fingerprint.insert(*path, FingerprintEntry::file(ContentHash::of(content)));
        }
        fingerprint
    }

    fn props(entries: &[(&str, Fingerprint)]) -> BTreeMap<String, Fingerprint> {
        entries
            .iter()
            .map(|(name, fp)| (name.to_string(), fp.clone()))
            .collect()
    }

    struct Fixture {
        implementation: Implementation,
        inputs: BTreeMap<String, Fingerprint>,
        outputs: BTreeMap<String, Fingerprint>,
        upstream: Option<ContentHash>,
        executed: Vec<WorkUnitId>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                implementation: Implementation::new("compile", "1"),
                inputs: props(&[("sources", files(&[("src/a.rs", "a"), ("src/b.rs", "b")]))]),
                outputs: props(&[("classes", files(&[("classes/A.class", "A")]))]),
                upstream: Some(ContentHash::of("upstream")),
                executed: Vec::new(),
            }
        }

        fn state(&self) -> CurrentState<'_> {
            CurrentState {
                implementation: &self.implementation,
                inputs: &self.inputs,
                outputs: &self.outputs,
                upstream: self.upstream.as_ref(),
                executed_dependencies: &self.executed,
            }
        }

        fn record(&self) -> ExecutionHistoryRecord {
            ExecutionHistoryRecord {
                implementation: self.implementation.clone(),
                inputs: self.inputs.clone(),
                outputs: self.outputs.clone(),
                upstream: self.upstream.clone(),
                cache_key: None,
                duration_ms: 5,
                success: true,
                origin: ExecutionOrigin::now(InvocationId::new(), ExecutionOutcome::Executed),
            }
        }
    }

    #[test]
    fn test_no_history() {
        let fixture = Fixture::new();
        let status = UpToDateChecker::default().check(&fixture.state(), None);
        assert_eq!(status, UpToDateStatus::NoHistory);
        assert_eq!(status.into_changes(), vec![ChangeReason::NoHistory]);
    }

    #[test]
    fn test_unchanged_unit_is_up_to_date() {
        let fixture = Fixture::new();
        let record = fixture.record();
        let status = UpToDateChecker::default().check(&fixture.state(), Some(&record));
        assert!(status.is_up_to_date());
    }

    #[test]
    fn test_input_changes_are_listed_in_path_order() {
        let mut fixture = Fixture::new();
        let record = fixture.record();
        fixture.inputs = props(&[(
            "sources",
            files(&[("src/0.rs", "new"), ("src/b.rs", "changed")]),
        )]);

        let changes = UpToDateChecker::default()
            .check(&fixture.state(), Some(&record))
            .into_changes();

        let paths: Vec<_> = changes
            .iter()
            .map(|change| match change {
                ChangeReason::InputFileChanged { path, change, .. } => (path.as_str(), *change),
                other => panic!("unexpected change {other:?}"),
            })
            .collect();
        assert_eq!(
            paths,
            vec![
                ("src/0.rs", FileChange::Added),
                ("src/a.rs", FileChange::Removed),
                ("src/b.rs", FileChange::Modified),
            ]
        );
    }

    #[test]
    fn test_implementation_change_invalidates() {
        let mut fixture = Fixture::new();
        let record = fixture.record();
        fixture.implementation = Implementation::new("compile", "2");

        let changes = UpToDateChecker::default()
            .check(&fixture.state(), Some(&record))
            .into_changes();
        assert!(matches!(
            changes.as_slice(),
            [ChangeReason::ImplementationChanged { .. }]
        ));
    }

    #[test]
    fn test_externally_modified_output_invalidates() {
        let mut fixture = Fixture::new();
        let record = fixture.record();
        fixture.outputs = props(&[("classes", files(&[("classes/A.class", "tampered")]))]);

        let changes = UpToDateChecker::default()
            .check(&fixture.state(), Some(&record))
            .into_changes();
        assert_eq!(
            changes,
            vec![ChangeReason::OutputFileChanged {
                property: "classes".into(),
                path: "classes/A.class".into(),
                change: FileChange::Modified,
            }]
        );
    }

    #[test]
    fn test_failed_previous_execution_invalidates() {
        let fixture = Fixture::new();
        let mut record = fixture.record();
        record.success = false;

        let changes = UpToDateChecker::default()
            .check(&fixture.state(), Some(&record))
            .into_changes();
        assert_eq!(changes, vec![ChangeReason::PreviousExecutionFailed]);
    }

    #[test]
    fn test_unit_without_outputs_is_never_up_to_date() {
        let mut fixture = Fixture::new();
        fixture.outputs = BTreeMap::new();
        let record = fixture.record();

        let changes = UpToDateChecker::default()
            .check(&fixture.state(), Some(&record))
            .into_changes();
        assert_eq!(changes, vec![ChangeReason::NoOutputsDeclared]);
    }

    #[test]
    fn test_value_change_is_reported_per_property() {
        let mut fixture = Fixture::new();
        let mut value = Fingerprint::new();
        value.insert("", FingerprintEntry::value(ContentHash::of("\"debug\"")));
        fixture.inputs.insert("profile".into(), value);
        let record = fixture.record();

        let mut changed = Fingerprint::new();
        changed.insert("", FingerprintEntry::value(ContentHash::of("\"release\"")));
        fixture.inputs.insert("profile".into(), changed);

        let changes = UpToDateChecker::default()
            .check(&fixture.state(), Some(&record))
            .into_changes();
        assert_eq!(
            changes,
            vec![ChangeReason::InputValueChanged {
                property: "profile".into()
            }]
        );
    }

    #[test]
    fn test_dependency_invalidation_policies() {
        let mut fixture = Fixture::new();
        let record = fixture.record();
        fixture.executed = vec![WorkUnitId::from("a")];

        let on_execution = UpToDateChecker::new(DependencyInvalidation::OnExecution)
            .check(&fixture.state(), Some(&record));
        assert_eq!(
            on_execution.into_changes(),
            vec![ChangeReason::DependencyExecuted {
                dependency: "a".into()
            }]
        );

        // Re-executed with identical outputs: only OnExecution cares
        let on_output = UpToDateChecker::new(DependencyInvalidation::OnOutputChange)
            .check(&fixture.state(), Some(&record));
        assert!(on_output.is_up_to_date());

        fixture.upstream = Some(ContentHash::of("different"));
        let on_output = UpToDateChecker::new(DependencyInvalidation::OnOutputChange)
            .check(&fixture.state(), Some(&record));
        assert_eq!(on_output.into_changes(), vec![ChangeReason::UpstreamChanged]);

        let never = UpToDateChecker::new(DependencyInvalidation::Never)
            .check(&fixture.state(), Some(&record));
        assert!(never.is_up_to_date());
    }

    #[test]
    fn test_rerun_all_forces_execution() {
        let fixture = Fixture::new();
        let record = fixture.record();
        let status = UpToDateChecker::default()
            .rerun_all(true)
            .check(&fixture.state(), Some(&record));
        assert_eq!(status.into_changes(), vec![ChangeReason::RerunRequested]);
    }
}
