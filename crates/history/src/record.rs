use chrono::{DateTime, Utc};
use kiln_core::{
    CacheKey, ContentHash, ExecutionOutcome, Implementation, InvocationId, WorkUnitId,
    HISTORY_FORMAT_VERSION,
};
use kiln_fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// State of a unit after its most recent execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHistoryRecord {
    pub implementation: Implementation,
    pub inputs: BTreeMap<String, Fingerprint>,
    pub outputs: BTreeMap<String, Fingerprint>,
    /// Digest over the dependencies' outputs at execution time
    #[serde(default)]
    pub upstream: Option<ContentHash>,
    #[serde(default)]
    pub cache_key: Option<CacheKey>,
    pub duration_ms: u64,
    pub success: bool,
    pub origin: ExecutionOrigin,
}

/// Which invocation produced a record, and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOrigin {
    pub build_invocation_id: InvocationId,
    pub executed_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
}

impl ExecutionOrigin {
    pub fn now(build_invocation_id: InvocationId, outcome: ExecutionOutcome) -> Self {
        Self {
            build_invocation_id,
            executed_at: Utc::now(),
            outcome,
        }
    }
}

/// On-disk envelope of a record
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedRecord<'a> {
    pub version: u32,
    pub identity: Cow<'a, WorkUnitId>,
    pub record: Cow<'a, ExecutionHistoryRecord>,
}

impl<'a> PersistedRecord<'a> {
    pub fn borrowed(identity: &'a WorkUnitId, record: &'a ExecutionHistoryRecord) -> Self {
        Self {
            version: HISTORY_FORMAT_VERSION,
            identity: Cow::Borrowed(identity),
            record: Cow::Borrowed(record),
        }
    }
}
