//! Origin metadata recorded with executions and cache entries

use super::{InvocationId, WorkUnitId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an output originally came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMetadata {
    pub identity: WorkUnitId,
    pub build_invocation_id: InvocationId,
    pub execution_duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl OriginMetadata {
    pub fn new(identity: WorkUnitId, build_invocation_id: InvocationId, duration_ms: u64) -> Self {
        Self {
            identity,
            build_invocation_id,
            execution_duration_ms: duration_ms,
            created_at: Utc::now(),
        }
    }
}
