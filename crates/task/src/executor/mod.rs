//! Scheduling and execution of a sealed [`WorkGraph`].
//!
//! A single coordinator owns the per-invocation state table and is the only
//! place where unit states change. Workers evaluate one unit each on a
//! [`JoinSet`] and report back; the coordinator releases dependents, skips
//! what can no longer run and publishes every transition as an
//! [`ExecutionEvent`].

mod state;
mod worker;

use self::state::{upstream_digest, SchedulerState};
use self::worker::{run_unit, UnitCompletion, UnitJob};
use crate::cancel::CancellationHandle;
use crate::config::{BuildConfig, FailureMode};
use crate::graph::WorkGraph;
use crate::report::BuildReport;
use futures::FutureExt;
use kiln_cache::{BuildCacheController, CacheKeyBuilder};
use kiln_core::{
    BuildStatus, Error, EventEmitter, ExecutionEvent, ExecutionOutcome, FailureCause,
    FailureKind, InvocationId, Result, SkipReason, WorkUnitId,
};
use kiln_fingerprint::Fingerprinter;
use kiln_history::{ExecutionHistoryStore, UpToDateChecker};
use kiln_utils::tracing::{build_span, unit_span};
use petgraph::graph::NodeIndex;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument};

/// Long-lived collaborators shared by every unit of every invocation
pub struct ExecutionServices {
    pub(crate) fingerprinter: Fingerprinter,
    pub(crate) history: ExecutionHistoryStore,
    pub(crate) cache: BuildCacheController,
    pub(crate) key_builder: CacheKeyBuilder,
    pub(crate) events: Arc<EventEmitter>,
}

impl ExecutionServices {
    pub fn new(
        history: ExecutionHistoryStore,
        cache: BuildCacheController,
        events: Arc<EventEmitter>,
    ) -> Self {
        Self {
            fingerprinter: Fingerprinter::new(),
            history,
            cache,
            key_builder: CacheKeyBuilder::new(),
            events,
        }
    }

    /// Open the history store and cache backends described by `config`.
    ///
    /// History goes to `config.history_dir` when set and to the workspace's
    /// XDG state directory otherwise.
    pub fn from_config(config: &BuildConfig, workspace_root: &Path) -> Result<Self> {
        let history = match &config.history_dir {
            Some(dir) => ExecutionHistoryStore::open(dir.clone())?,
            None => ExecutionHistoryStore::for_workspace(workspace_root)?,
        };
        let cache = BuildCacheController::from_settings(&config.cache)
            .map_err(|e| Error::configuration(e.to_string()))?;
        Ok(Self::new(
            history,
            cache,
            Arc::new(EventEmitter::with_logging()),
        ))
    }

    pub fn history(&self) -> &ExecutionHistoryStore {
        &self.history
    }

    pub fn cache(&self) -> &BuildCacheController {
        &self.cache
    }

    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.events
    }
}

impl fmt::Debug for ExecutionServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionServices")
            .field("history", &self.history)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Runs work graphs against a set of [`ExecutionServices`]
#[derive(Debug)]
pub struct Executor {
    config: BuildConfig,
    services: Arc<ExecutionServices>,
    checker: UpToDateChecker,
    cancellation: CancellationHandle,
}

impl Executor {
    pub fn new(config: BuildConfig, services: Arc<ExecutionServices>) -> Self {
        let checker =
            UpToDateChecker::new(config.dependency_invalidation).rerun_all(config.rerun_all);
        Self {
            config,
            services,
            checker,
            cancellation: CancellationHandle::new(),
        }
    }

    pub fn from_config(config: BuildConfig, workspace_root: &Path) -> Result<Self> {
        config.validate()?;
        let services = ExecutionServices::from_config(&config, workspace_root)?;
        Ok(Self::new(config, Arc::new(services)))
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationHandle) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationHandle {
        &self.cancellation
    }

    pub fn services(&self) -> &Arc<ExecutionServices> {
        &self.services
    }

    /// Execute every unit of `graph` and report what happened to each.
    ///
    /// Unit failures never surface as an `Err`; they are part of the
    /// report. Use [`Executor::run`] to turn an unsuccessful build into one.
    pub async fn execute(&self, graph: &WorkGraph) -> BuildReport {
        let invocation_id = InvocationId::new();
        let span = build_span(&invocation_id, graph.len());
        self.coordinate(graph, invocation_id).instrument(span).await
    }

    /// Like [`Executor::execute`], failing unless every unit succeeded
    pub async fn run(&self, graph: &WorkGraph) -> Result<BuildReport> {
        self.execute(graph).await.into_result()
    }

    async fn coordinate(&self, graph: &WorkGraph, invocation_id: InvocationId) -> BuildReport {
        let started = Instant::now();
        let max_parallelism = self.config.max_parallelism.max(1);
        info!(
            units = graph.len(),
            max_parallelism,
            failure_mode = %self.config.failure_mode,
            "Starting build"
        );
        self.publish(ExecutionEvent::BuildStarted {
            invocation_id,
            units: graph.len(),
            max_parallelism,
        })
        .await;

        let mut state = SchedulerState::new(graph);
        let mut running: JoinSet<(NodeIndex, UnitCompletion)> = JoinSet::new();
        let mut cancel_rx = self.cancellation.subscribe();
        let mut listening = true;
        let mut grace_deadline: Option<tokio::time::Instant> = None;
        let mut aborted = false;

        loop {
            if grace_deadline.is_none() && self.cancellation.is_cancelled() {
                grace_deadline = Some(self.begin_cancellation(&mut state).await);
            }

            if grace_deadline.is_none() && !aborted {
                while running.len() < max_parallelism {
                    let Some(node) = state.pop_ready() else {
                        break;
                    };
                    self.dispatch(graph, &mut state, &mut running, node, invocation_id)
                        .await;
                }
            }

            if running.is_empty() {
                break;
            }

            let joined = match grace_deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, running.join_next()).await
                {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            units = running.len(),
                            "Cancellation grace period expired, aborting running units"
                        );
                        running.abort_all();
                        break;
                    }
                },
                None => tokio::select! {
                    biased;
                    requested = cancel_rx.wait_for(|cancelled| *cancelled).map(|r| r.is_ok()),
                        if listening =>
                    {
                        // A closed channel means no handle is left to cancel with
                        listening = requested;
                        continue;
                    }
                    joined = running.join_next() => joined,
                },
            };

            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok((node, completion)) => {
                    let failed = self.finish_unit(&mut state, node, completion).await;
                    if failed
                        && self.config.failure_mode == FailureMode::FailFast
                        && !aborted
                        && grace_deadline.is_none()
                    {
                        aborted = true;
                        let reason = SkipReason::BuildAborted {
                            failed: state.id(node).clone(),
                        };
                        info!("Not starting further units after a failure");
                        let skipped = state.skip_waiting(&reason);
                        self.publish_skipped(&state, skipped).await;
                    }
                }
                Err(e) => warn!("Unit task ended unexpectedly: {e}"),
            }
        }

        // Collect whatever finished while being aborted
        while let Some(joined) = running.join_next().await {
            if let Ok((node, completion)) = joined {
                self.finish_unit(&mut state, node, completion).await;
            }
        }

        let cancelled = grace_deadline.is_some();
        for node in state.running() {
            if cancelled {
                state.skip(node, SkipReason::Cancelled);
                self.publish_skipped(&state, vec![(node, SkipReason::Cancelled)])
                    .await;
            } else {
                let duration = state.elapsed(node);
                state.fail(
                    node,
                    FailureCause::new(FailureKind::Internal, "unit task ended without a result"),
                    duration,
                );
                let skipped = state.skip_dependents(node);
                self.publish_skipped(&state, skipped).await;
            }
        }

        let counts = state.counts();
        let status = if cancelled {
            BuildStatus::Cancelled
        } else if counts.get(ExecutionOutcome::Failed) > 0 {
            BuildStatus::Failed
        } else {
            BuildStatus::Succeeded
        };
        let duration = started.elapsed();
        self.publish(ExecutionEvent::BuildFinished {
            invocation_id,
            status,
            counts,
            duration_ms: millis(duration),
        })
        .await;

        let cache_stats = self.services.cache.stats();
        info!(
            %status,
            up_to_date = counts.get(ExecutionOutcome::UpToDate),
            from_cache = counts.get(ExecutionOutcome::FromCache),
            executed = counts.get(ExecutionOutcome::Executed),
            failed = counts.get(ExecutionOutcome::Failed),
            skipped = counts.get(ExecutionOutcome::Skipped),
            %cache_stats,
            duration_ms = millis(duration),
            "Build finished"
        );

        BuildReport {
            invocation_id,
            status,
            units: state.into_reports(),
            counts,
            cache_stats,
            duration,
        }
    }

    async fn dispatch(
        &self,
        graph: &WorkGraph,
        state: &mut SchedulerState<'_>,
        running: &mut JoinSet<(NodeIndex, UnitCompletion)>,
        node: NodeIndex,
        invocation_id: InvocationId,
    ) {
        let unit = Arc::clone(graph.node(node));
        let (upstream, executed_dependencies) = {
            let dependencies = state.dependency_results(node);
            let upstream = (self.config.dependency_invalidation.tracks_upstream()
                && !dependencies.is_empty())
            .then(|| upstream_digest(&dependencies));
            let executed: Vec<WorkUnitId> = dependencies
                .iter()
                .filter(|dependency| dependency.outcome.did_work())
                .map(|dependency| dependency.id.clone())
                .collect();
            (upstream, executed)
        };

        state.mark_running(node);
        self.publish(ExecutionEvent::UnitStarted {
            unit: unit.id().clone(),
        })
        .await;

        let span = unit_span(unit.id());
        let services = Arc::clone(&self.services);
        let checker = self.checker;
        let job = UnitJob {
            unit,
            upstream,
            executed_dependencies,
            invocation_id,
        };
        running.spawn(
            async move {
                let completion = AssertUnwindSafe(run_unit(services, checker, job))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        UnitCompletion::Failed(FailureCause::new(
                            FailureKind::Internal,
                            format!("unit panicked: {}", panic_message(panic.as_ref())),
                        ))
                    });
                (node, completion)
            }
            .instrument(span),
        );
    }

    /// Record a worker's result. Returns whether the unit failed.
    async fn finish_unit(
        &self,
        state: &mut SchedulerState<'_>,
        node: NodeIndex,
        completion: UnitCompletion,
    ) -> bool {
        let duration = state.elapsed(node);
        let unit = state.id(node).clone();
        match completion {
            UnitCompletion::Succeeded {
                outcome,
                output_hash,
            } => {
                state.complete(node, outcome, output_hash, duration);
                self.publish(ExecutionEvent::UnitFinished {
                    unit,
                    outcome,
                    duration_ms: millis(duration),
                })
                .await;
                false
            }
            UnitCompletion::Skipped(reason) => {
                state.pass(node, reason.clone());
                self.publish_skipped(state, vec![(node, reason)]).await;
                false
            }
            UnitCompletion::Failed(cause) => {
                warn!(unit = %unit, kind = ?cause.kind, "{}", cause.message);
                state.fail(node, cause, duration);
                self.publish(ExecutionEvent::UnitFinished {
                    unit,
                    outcome: ExecutionOutcome::Failed,
                    duration_ms: millis(duration),
                })
                .await;
                let skipped = state.skip_dependents(node);
                self.publish_skipped(state, skipped).await;
                true
            }
        }
    }

    /// Skip everything that has not started and return the grace deadline
    /// for units already running
    async fn begin_cancellation(&self, state: &mut SchedulerState<'_>) -> tokio::time::Instant {
        let grace = self.config.cancellation_grace();
        warn!(
            grace_ms = millis(grace),
            "Build cancelled, waiting for running units"
        );
        let skipped = state.skip_waiting(&SkipReason::Cancelled);
        self.publish_skipped(state, skipped).await;
        tokio::time::Instant::now() + grace
    }

    async fn publish_skipped(
        &self,
        state: &SchedulerState<'_>,
        skipped: Vec<(NodeIndex, SkipReason)>,
    ) {
        for (node, reason) in skipped {
            self.publish(ExecutionEvent::UnitSkipped {
                unit: state.id(node).clone(),
                reason,
            })
            .await;
        }
    }

    async fn publish(&self, event: ExecutionEvent) {
        self.services.events.publish(event).await;
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
