//! Event subscriber trait and the logging subscriber

use super::types::{EventEnvelope, ExecutionEvent};
use crate::types::ExecutionOutcome;
use tracing::{debug, info, warn};

/// Trait for event subscribers
#[async_trait::async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Handle an event
    async fn handle_event(
        &self,
        event: &EventEnvelope,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Subscriber name for debugging
    fn name(&self) -> &'static str;

    /// Check if subscriber is interested in this event
    fn is_interested(&self, _event: &ExecutionEvent) -> bool {
        true
    }
}

/// Forwards execution events into `tracing`
#[derive(Debug, Default)]
pub struct LoggingSubscriber;

#[async_trait::async_trait]
impl EventSubscriber for LoggingSubscriber {
    async fn handle_event(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match &envelope.event {
            ExecutionEvent::BuildStarted {
                invocation_id,
                units,
                max_parallelism,
            } => info!(%invocation_id, units, max_parallelism, "Build started"),
            ExecutionEvent::UnitStarted { unit } => debug!(%unit, "Unit started"),
            ExecutionEvent::UnitFinished {
                unit,
                outcome: ExecutionOutcome::Failed,
                duration_ms,
            } => warn!(%unit, duration_ms, "Unit FAILED"),
            ExecutionEvent::UnitFinished {
                unit,
                outcome,
                duration_ms,
            } => info!(%unit, duration_ms, "Unit {outcome}"),
            ExecutionEvent::UnitSkipped { unit, reason } => {
                info!(%unit, %reason, "Unit SKIPPED")
            }
            ExecutionEvent::BuildFinished {
                status,
                counts,
                duration_ms,
                ..
            } => info!(duration_ms, "Build {status}: {counts}"),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}
