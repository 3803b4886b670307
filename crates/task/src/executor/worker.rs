//! Evaluation of a single unit: up-to-date check, cache load, execution.
//!
//! Runs on a spawned task. Blocking filesystem work (fingerprinting,
//! history I/O, unpacking) is moved onto the blocking pool. Nothing here
//! touches the coordinator's state table; the result is handed back as a
//! [`UnitCompletion`].

use super::ExecutionServices;
use crate::action::{ActionContext, ActionOutput};
use crate::unit::WorkUnit;
use kiln_cache::{CacheKeyInputs, CachedEntry};
use kiln_core::{
    ActionError, CacheKey, ContentHash, ExecutionOutcome, FailureCause, FailureKind,
    FingerprintError, InvocationId, OriginMetadata, SkipReason, TreeType, WorkUnitId,
};
use kiln_fingerprint::{hash_properties, Fingerprint};
use kiln_history::{
    ChangeReason, CurrentState, ExecutionHistoryRecord, ExecutionOrigin, UpToDateChecker,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

type Fingerprints = BTreeMap<String, Fingerprint>;

/// Everything a worker needs to evaluate one unit
pub(crate) struct UnitJob {
    pub unit: Arc<WorkUnit>,
    /// Digest over the dependencies' outputs, when dependencies are tracked
    pub upstream: Option<ContentHash>,
    /// Dependencies that executed or were loaded from cache in this invocation
    pub executed_dependencies: Vec<WorkUnitId>,
    pub invocation_id: InvocationId,
}

#[derive(Debug)]
pub(crate) enum UnitCompletion {
    Succeeded {
        outcome: ExecutionOutcome,
        /// Combined hash of the unit's output fingerprints
        output_hash: ContentHash,
    },
    /// The unit declined to run; dependents are released all the same
    Skipped(SkipReason),
    Failed(FailureCause),
}

struct Snapshot {
    inputs: Fingerprints,
    outputs: Fingerprints,
    history: Option<ExecutionHistoryRecord>,
}

pub(crate) async fn run_unit(
    services: Arc<ExecutionServices>,
    checker: UpToDateChecker,
    job: UnitJob,
) -> UnitCompletion {
    evaluate(&services, checker, &job)
        .await
        .unwrap_or_else(UnitCompletion::Failed)
}

async fn evaluate(
    services: &Arc<ExecutionServices>,
    checker: UpToDateChecker,
    job: &UnitJob,
) -> Result<UnitCompletion, FailureCause> {
    let unit = &job.unit;
    if !unit.preconditions_met() {
        debug!("Precondition not met, skipping");
        return Ok(UnitCompletion::Skipped(SkipReason::PreconditionNotMet));
    }
    let snapshot = take_snapshot(services, unit).await?;

    let status = checker.check_unit(
        unit.id(),
        &CurrentState {
            implementation: unit.implementation(),
            inputs: &snapshot.inputs,
            outputs: &snapshot.outputs,
            upstream: job.upstream.as_ref(),
            executed_dependencies: &job.executed_dependencies,
        },
        snapshot.history.as_ref(),
    );
    if status.is_up_to_date() {
        return Ok(UnitCompletion::Succeeded {
            outcome: ExecutionOutcome::UpToDate,
            output_hash: hash_properties(&snapshot.outputs),
        });
    }
    let changes = status.into_changes();

    let cache_key = (unit.is_cacheable() && services.cache.is_enabled()).then(|| {
        services.key_builder.build(&CacheKeyInputs {
            implementation: unit.implementation(),
            inputs: &snapshot.inputs,
            outputs: unit.outputs(),
            upstream: job.upstream.as_ref(),
        })
    });

    if let Some(key) = &cache_key {
        if let Some(entry) = services.cache.load(key).await {
            if let Some(completion) =
                restore_from_cache(services, job, key, entry, &snapshot.inputs).await
            {
                return Ok(completion);
            }
        }
    }

    execute(services, job, snapshot.inputs, changes, cache_key).await
}

async fn take_snapshot(
    services: &Arc<ExecutionServices>,
    unit: &Arc<WorkUnit>,
) -> Result<Snapshot, FailureCause> {
    let services = Arc::clone(services);
    let unit = Arc::clone(unit);
    let snapshot = tokio::task::spawn_blocking(move || -> Result<Snapshot, FingerprintError> {
        Ok(Snapshot {
            inputs: services.fingerprinter.fingerprint_inputs(unit.inputs())?,
            outputs: services.fingerprinter.fingerprint_outputs(unit.outputs())?,
            history: services.history.load(unit.id()),
        })
    })
    .await;
    match snapshot {
        Ok(Ok(snapshot)) => Ok(snapshot),
        Ok(Err(e)) => Err(FailureCause::new(FailureKind::Fingerprint, e.to_string())),
        Err(e) => Err(FailureCause::new(
            FailureKind::Internal,
            format!("fingerprinting task failed: {e}"),
        )),
    }
}

/// Unpack a cache entry into the unit's outputs. `None` means the entry was
/// unusable and the unit has to execute.
async fn restore_from_cache(
    services: &Arc<ExecutionServices>,
    job: &UnitJob,
    key: &CacheKey,
    entry: CachedEntry,
    inputs: &Fingerprints,
) -> Option<UnitCompletion> {
    let unit = Arc::clone(&job.unit);
    let fingerprinter = services.fingerprinter;
    let restored = tokio::task::spawn_blocking(move || {
        let metadata = entry
            .unpack_into(unit.outputs())
            .map_err(|e| e.to_string())?;
        let outputs = fingerprinter
            .fingerprint_outputs(unit.outputs())
            .map_err(|e| e.to_string())?;
        Ok::<_, String>((metadata, outputs))
    })
    .await
    .map_err(|e| e.to_string())
    .and_then(|restored| restored);

    let (metadata, outputs) = match restored {
        Ok(restored) => restored,
        Err(reason) => {
            warn!(
                unit = %job.unit.id(),
                %key,
                "Failed to load outputs from build cache, executing instead: {reason}"
            );
            invalidate_history(services, job.unit.id()).await;
            return None;
        }
    };

    debug!(
        unit = %job.unit.id(),
        %key,
        origin = %metadata.origin.build_invocation_id,
        "Loaded outputs from build cache"
    );
    let output_hash = hash_properties(&outputs);
    let record = ExecutionHistoryRecord {
        implementation: job.unit.implementation().clone(),
        inputs: inputs.clone(),
        outputs,
        upstream: job.upstream.clone(),
        cache_key: Some(key.clone()),
        duration_ms: metadata.origin.execution_duration_ms,
        success: true,
        origin: ExecutionOrigin::now(job.invocation_id, ExecutionOutcome::FromCache),
    };
    store_history(services, job.unit.id(), record).await;

    Some(UnitCompletion::Succeeded {
        outcome: ExecutionOutcome::FromCache,
        output_hash,
    })
}

async fn execute(
    services: &Arc<ExecutionServices>,
    job: &UnitJob,
    inputs: Fingerprints,
    changes: Vec<ChangeReason>,
    cache_key: Option<CacheKey>,
) -> Result<UnitCompletion, FailureCause> {
    let unit = &job.unit;
    prepare_outputs(unit).await?;

    let context = ActionContext::new(Arc::clone(unit), changes, job.invocation_id);
    let started = Instant::now();
    let result = unit.action().execute(&context).await;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let outputs = {
        let fingerprinter = services.fingerprinter;
        let unit = Arc::clone(unit);
        tokio::task::spawn_blocking(move || fingerprinter.fingerprint_outputs(unit.outputs()))
            .await
    };
    let outputs = match outputs {
        Ok(Ok(outputs)) => outputs,
        Ok(Err(e)) => {
            invalidate_history(services, unit.id()).await;
            return Err(match result {
                Err(action) => action_failure(&action),
                Ok(_) => FailureCause::new(FailureKind::Fingerprint, e.to_string()),
            });
        }
        Err(e) => {
            invalidate_history(services, unit.id()).await;
            return Err(FailureCause::new(
                FailureKind::Internal,
                format!("fingerprinting task failed: {e}"),
            ));
        }
    };

    let output_hash = hash_properties(&outputs);
    let outcome = if result.is_ok() {
        ExecutionOutcome::Executed
    } else {
        ExecutionOutcome::Failed
    };
    let record = ExecutionHistoryRecord {
        implementation: unit.implementation().clone(),
        inputs,
        outputs,
        upstream: job.upstream.clone(),
        cache_key: cache_key.clone(),
        duration_ms,
        success: result.is_ok(),
        origin: ExecutionOrigin::now(job.invocation_id, outcome),
    };
    store_history(services, unit.id(), record).await;

    let output = result.map_err(|e| action_failure(&e))?;
    warn_undeclared_outputs(unit, &output);

    if let Some(key) = cache_key {
        let origin = OriginMetadata::new(unit.id().clone(), job.invocation_id, duration_ms);
        services.cache.store(&key, unit.outputs(), origin).await;
    }

    Ok(UnitCompletion::Succeeded {
        outcome: ExecutionOutcome::Executed,
        output_hash,
    })
}

/// Create the directories declared outputs are written into
async fn prepare_outputs(unit: &WorkUnit) -> Result<(), FailureCause> {
    for location in unit.outputs().values() {
        let dir = match location.tree {
            TreeType::Directory => Some(location.path.as_path()),
            TreeType::File => location.path.parent(),
        };
        let Some(dir) = dir.filter(|dir| !dir.as_os_str().is_empty()) else {
            continue;
        };
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            FailureCause::new(
                FailureKind::Action,
                format!("failed to create output directory '{}': {e}", dir.display()),
            )
        })?;
    }
    Ok(())
}

fn action_failure(error: &ActionError) -> FailureCause {
    let message = match std::error::Error::source(error) {
        Some(source) if source.to_string() != error.message() => {
            format!("{}: {source}", error.message())
        }
        _ => error.message().to_string(),
    };
    FailureCause::new(FailureKind::Action, message)
}

fn warn_undeclared_outputs(unit: &WorkUnit, output: &ActionOutput) {
    for path in &output.produced {
        let declared = unit.outputs().values().any(|location| {
            *path == location.path
                || (location.tree == TreeType::Directory && path.starts_with(&location.path))
        });
        if !declared {
            warn!(
                unit = %unit.id(),
                path = %path.display(),
                "Action produced a file outside its declared outputs"
            );
        }
    }
}

async fn store_history(
    services: &Arc<ExecutionServices>,
    id: &WorkUnitId,
    record: ExecutionHistoryRecord,
) {
    let services = Arc::clone(services);
    let id = id.clone();
    let stored =
        tokio::task::spawn_blocking(move || services.history.store(&id, &record).map_err(|e| (id, e)))
            .await;
    match stored {
        Ok(Ok(())) => {}
        Ok(Err((id, e))) => warn!(unit = %id, "Failed to record execution history: {e}"),
        Err(e) => warn!("Execution history task failed: {e}"),
    }
}

async fn invalidate_history(services: &Arc<ExecutionServices>, id: &WorkUnitId) {
    let services = Arc::clone(services);
    let id = id.clone();
    let result =
        tokio::task::spawn_blocking(move || services.history.invalidate(&id).map_err(|e| (id, e)))
            .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err((id, e))) => warn!(unit = %id, "Failed to invalidate execution history: {e}"),
        Err(e) => warn!("Execution history task failed: {e}"),
    }
}
