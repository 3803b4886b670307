//! Outcome summary of one invocation

use kiln_cache::CacheStatsSnapshot;
use kiln_core::{
    BuildFailure, BuildStatus, Error, ExecutionOutcome, FailureCause, InvocationId,
    OutcomeCounts, Result, SkipReason, UnitFailure, WorkUnitId,
};
use std::fmt;
use std::time::Duration;

/// Final state of one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub unit: WorkUnitId,
    pub outcome: ExecutionOutcome,
    /// Time spent running; zero for skipped units
    pub duration: Duration,
    pub failure: Option<FailureCause>,
    pub skip_reason: Option<SkipReason>,
}

impl fmt::Display for UnitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "> {} {}", self.unit, self.outcome)?;
        if let Some(reason) = &self.skip_reason {
            write!(f, " ({reason})")?;
        }
        if let Some(failure) = &self.failure {
            write!(f, ": {failure}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub invocation_id: InvocationId,
    pub status: BuildStatus,
    /// Every unit of the graph, in declaration order
    pub units: Vec<UnitReport>,
    pub counts: OutcomeCounts,
    pub cache_stats: CacheStatsSnapshot,
    pub duration: Duration,
}

impl BuildReport {
    pub fn unit(&self, id: &str) -> Option<&UnitReport> {
        self.units.iter().find(|report| report.unit.as_str() == id)
    }

    pub fn outcome(&self, id: &str) -> Option<ExecutionOutcome> {
        self.unit(id).map(|report| report.outcome)
    }

    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Succeeded
    }

    /// Every failed unit with its cause
    pub fn failures(&self) -> Vec<UnitFailure> {
        self.units
            .iter()
            .filter_map(|report| {
                report.failure.clone().map(|cause| UnitFailure {
                    unit: report.unit.clone(),
                    cause,
                })
            })
            .collect()
    }

    /// `Ok` for a successful build, the aggregated failure or
    /// [`Error::Cancelled`] otherwise
    pub fn into_result(self) -> Result<BuildReport> {
        match self.status {
            BuildStatus::Succeeded => Ok(self),
            BuildStatus::Failed => Err(Error::BuildFailed(BuildFailure::new(self.failures()))),
            BuildStatus::Cancelled => Err(Error::Cancelled),
        }
    }
}

impl fmt::Display for BuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for unit in &self.units {
            writeln!(f, "{unit}")?;
        }
        writeln!(
            f,
            "BUILD {} in {:.1}s",
            self.status,
            self.duration.as_secs_f64()
        )?;
        writeln!(f, "{} units: {}", self.counts.total(), self.counts)?;
        write!(f, "Build cache: {}", self.cache_stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::FailureKind;

    fn report(status: BuildStatus, units: Vec<UnitReport>) -> BuildReport {
        let mut counts = OutcomeCounts::default();
        for unit in &units {
            counts.record(unit.outcome);
        }
        BuildReport {
            invocation_id: InvocationId::new(),
            status,
            units,
            counts,
            cache_stats: CacheStatsSnapshot::default(),
            duration: Duration::from_millis(1500),
        }
    }

    fn unit(id: &str, outcome: ExecutionOutcome) -> UnitReport {
        UnitReport {
            unit: id.into(),
            outcome,
            duration: Duration::ZERO,
            failure: None,
            skip_reason: None,
        }
    }

    #[test]
    fn test_failed_build_aggregates_every_failure() {
        let mut compile = unit("compile", ExecutionOutcome::Failed);
        compile.failure = Some(FailureCause::new(FailureKind::Action, "exit code 2"));
        let mut lint = unit("lint", ExecutionOutcome::Failed);
        lint.failure = Some(FailureCause::new(FailureKind::Action, "3 warnings"));
        let mut test = unit("test", ExecutionOutcome::Skipped);
        test.skip_reason = Some(SkipReason::DependencyFailed {
            dependency: "compile".into(),
        });

        let report = report(BuildStatus::Failed, vec![compile, lint, test]);
        let rendered = report.to_string();
        assert!(rendered.contains("> test SKIPPED (dependency 'compile' failed)"));
        assert!(rendered.contains("BUILD FAILED in 1.5s"));

        match report.into_result() {
            Err(Error::BuildFailed(failure)) => {
                assert_eq!(failure.len(), 2);
                assert_eq!(failure.failures[1].unit.as_str(), "lint");
            }
            other => panic!("expected build failure, got {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_build_is_not_a_failure() {
        let report = report(
            BuildStatus::Cancelled,
            vec![unit("a", ExecutionOutcome::Skipped)],
        );
        assert!(matches!(report.into_result(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_successful_build_lookup() {
        let report = report(
            BuildStatus::Succeeded,
            vec![
                unit("a", ExecutionOutcome::UpToDate),
                unit("b", ExecutionOutcome::FromCache),
            ],
        );
        assert_eq!(report.outcome("b"), Some(ExecutionOutcome::FromCache));
        assert!(report.is_success());
        assert!(report.into_result().is_ok());
    }
}
