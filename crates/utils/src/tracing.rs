use kiln_core::{InvocationId, WorkUnitId};
use tracing::{span, Level, Span};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing system.
///
/// Honours `RUST_LOG`, defaulting to `info`, and writes compact lines to
/// stderr. Fails if a global subscriber is already installed.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .compact()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Span covering one build invocation
pub fn build_span(invocation_id: &InvocationId, units: usize) -> Span {
    span!(Level::INFO, "build", invocation_id = %invocation_id, units = units)
}

/// Span covering the evaluation of one work unit
pub fn unit_span(unit: &WorkUnitId) -> Span {
    span!(Level::INFO, "unit", unit = %unit)
}
