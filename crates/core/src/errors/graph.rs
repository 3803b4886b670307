//! Errors raised while building or validating a work graph

use crate::types::WorkUnitId;

/// Invalid dependency declaration. Always fatal for the whole invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("work unit identity must not be empty")]
    EmptyIdentity,

    #[error("work unit '{0}' is declared more than once")]
    DuplicateUnit(WorkUnitId),

    #[error("work unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency {
        unit: WorkUnitId,
        dependency: WorkUnitId,
    },

    #[error("work unit '{0}' depends on itself")]
    SelfDependency(WorkUnitId),

    #[error("circular dependency detected: {}", render_cycle(.0))]
    Cycle(Vec<WorkUnitId>),

    #[error("work unit '{unit}' declares invalid {kind} property '{property}': {reason}")]
    InvalidProperty {
        unit: WorkUnitId,
        kind: &'static str,
        property: String,
        reason: String,
    },

    #[error("requested work unit '{0}' is not part of the graph")]
    UnknownTarget(WorkUnitId),

    #[error("no work units were requested")]
    EmptyRequest,
}

fn render_cycle(path: &[WorkUnitId]) -> String {
    path.iter()
        .map(WorkUnitId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_renders_path() {
        let err = GraphError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "circular dependency detected: a -> b -> a");
    }
}
