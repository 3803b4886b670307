//! Event payloads

use crate::types::{
    BuildStatus, ExecutionOutcome, InvocationId, OutcomeCounts, SkipReason, WorkUnitId,
};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// A state transition observed during one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    BuildStarted {
        invocation_id: InvocationId,
        units: usize,
        max_parallelism: usize,
    },
    UnitStarted {
        unit: WorkUnitId,
    },
    UnitFinished {
        unit: WorkUnitId,
        outcome: ExecutionOutcome,
        duration_ms: u64,
    },
    UnitSkipped {
        unit: WorkUnitId,
        reason: SkipReason,
    },
    BuildFinished {
        invocation_id: InvocationId,
        status: BuildStatus,
        counts: OutcomeCounts,
        duration_ms: u64,
    },
}

impl ExecutionEvent {
    /// Unit the event is about, if any
    pub fn unit(&self) -> Option<&WorkUnitId> {
        match self {
            Self::UnitStarted { unit }
            | Self::UnitFinished { unit, .. }
            | Self::UnitSkipped { unit, .. } => Some(unit),
            Self::BuildStarted { .. } | Self::BuildFinished { .. } => None,
        }
    }
}

/// Event plus delivery metadata
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event: ExecutionEvent,
    pub timestamp: SystemTime,
    pub sequence: u64,
}
