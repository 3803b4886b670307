//! Aggregated failure report of an invocation

use crate::types::{FailureCause, WorkUnitId};
use std::fmt;

/// One failed unit and its cause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub unit: WorkUnitId,
    pub cause: FailureCause,
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}': {}", self.unit, self.cause)
    }
}

/// Every unit that failed in one invocation, in declaration order
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct BuildFailure {
    pub failures: Vec<UnitFailure>,
}

impl BuildFailure {
    pub fn new(failures: Vec<UnitFailure>) -> Self {
        Self { failures }
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.failures.len() == 1 {
            "failure"
        } else {
            "failures"
        };
        write!(f, "build failed with {} {noun}", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  - {failure}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FailureKind;

    #[test]
    fn test_build_failure_lists_every_unit() {
        let failure = BuildFailure::new(vec![
            UnitFailure {
                unit: "b".into(),
                cause: FailureCause::new(FailureKind::Action, "exit code 1"),
            },
            UnitFailure {
                unit: "d".into(),
                cause: FailureCause::new(FailureKind::Fingerprint, "permission denied"),
            },
        ]);
        assert_eq!(
            failure.to_string(),
            "build failed with 2 failures\n  - 'b': exit code 1\n  - 'd': permission denied"
        );
    }
}
