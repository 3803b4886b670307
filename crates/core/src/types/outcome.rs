//! Per-invocation outcomes of work units

use super::WorkUnitId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal outcome of a work unit within one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionOutcome {
    UpToDate,
    FromCache,
    Executed,
    Failed,
    Skipped,
}

impl ExecutionOutcome {
    /// Whether dependents may run after this outcome
    pub fn is_success(self) -> bool {
        matches!(self, Self::UpToDate | Self::FromCache | Self::Executed)
    }

    /// Whether the unit's outputs were (re)produced in this invocation
    pub fn did_work(self) -> bool {
        matches!(self, Self::FromCache | Self::Executed)
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UpToDate => "UP-TO-DATE",
            Self::FromCache => "FROM-CACHE",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(label)
    }
}

/// Why a unit was skipped without running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SkipReason {
    /// A direct dependency failed
    DependencyFailed { dependency: WorkUnitId },
    /// A direct dependency was itself skipped
    DependencySkipped { dependency: WorkUnitId },
    /// Fail-fast mode stopped dispatching after another unit failed
    BuildAborted { failed: WorkUnitId },
    /// A precondition declared on the unit evaluated to false
    PreconditionNotMet,
    /// The invocation was cancelled
    Cancelled,
}

impl SkipReason {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed { dependency } => {
                write!(f, "dependency '{dependency}' failed")
            }
            Self::DependencySkipped { dependency } => {
                write!(f, "dependency '{dependency}' was skipped")
            }
            Self::BuildAborted { failed } => {
                write!(f, "build aborted after '{failed}' failed")
            }
            Self::PreconditionNotMet => f.write_str("precondition not met"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Category of a unit failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// A declared input or output could not be fingerprinted
    Fingerprint,
    /// The unit's action reported failure
    Action,
    /// The worker itself broke down (panic, lost task)
    Internal,
}

/// Cause of a unit failure, as reported to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Overall result of an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Succeeded => "SUCCESSFUL",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

/// Number of units per outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub up_to_date: usize,
    pub from_cache: usize,
    pub executed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: ExecutionOutcome) {
        match outcome {
            ExecutionOutcome::UpToDate => self.up_to_date += 1,
            ExecutionOutcome::FromCache => self.from_cache += 1,
            ExecutionOutcome::Executed => self.executed += 1,
            ExecutionOutcome::Failed => self.failed += 1,
            ExecutionOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn get(&self, outcome: ExecutionOutcome) -> usize {
        match outcome {
            ExecutionOutcome::UpToDate => self.up_to_date,
            ExecutionOutcome::FromCache => self.from_cache,
            ExecutionOutcome::Executed => self.executed,
            ExecutionOutcome::Failed => self.failed,
            ExecutionOutcome::Skipped => self.skipped,
        }
    }

    pub fn total(&self) -> usize {
        self.up_to_date + self.from_cache + self.executed + self.failed + self.skipped
    }
}

impl fmt::Display for OutcomeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} up-to-date, {} from cache, {} executed, {} failed, {} skipped",
            self.up_to_date, self.from_cache, self.executed, self.failed, self.skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_outcomes_release_dependents() {
        assert!(ExecutionOutcome::UpToDate.is_success());
        assert!(ExecutionOutcome::FromCache.is_success());
        assert!(ExecutionOutcome::Executed.is_success());
        assert!(!ExecutionOutcome::Failed.is_success());
        assert!(!ExecutionOutcome::Skipped.is_success());
    }

    #[test]
    fn test_counts_record_every_outcome() {
        let mut counts = OutcomeCounts::default();
        counts.record(ExecutionOutcome::Executed);
        counts.record(ExecutionOutcome::Executed);
        counts.record(ExecutionOutcome::Skipped);
        assert_eq!(counts.get(ExecutionOutcome::Executed), 2);
        assert_eq!(counts.total(), 3);
        assert_eq!(
            counts.to_string(),
            "0 up-to-date, 0 from cache, 2 executed, 0 failed, 1 skipped"
        );
    }

    #[test]
    fn test_cancelled_skip_is_distinct_from_dependency_failure() {
        let failed = SkipReason::DependencyFailed {
            dependency: WorkUnitId::from("a"),
        };
        assert!(!failed.is_cancellation());
        assert!(SkipReason::Cancelled.is_cancellation());
        assert_eq!(failed.to_string(), "dependency 'a' failed");
        assert!(!SkipReason::PreconditionNotMet.is_cancellation());
        assert_eq!(
            SkipReason::PreconditionNotMet.to_string(),
            "precondition not met"
        );
    }
}
