//! Execution events.
//!
//! The scheduler publishes one event per unit state transition through an
//! [`EventEmitter`] handed to it at construction. There is no process-wide
//! emitter: every invocation owns the one it was given.

mod emitter;
mod subscriber;
mod types;

pub use emitter::{EventEmitter, EventStats};
pub use subscriber::{EventSubscriber, LoggingSubscriber};
pub use types::{EventEnvelope, ExecutionEvent};
