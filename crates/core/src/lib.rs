//! Core domain types, errors, and events for `kiln`.
//!
//! Everything the other kiln crates share lives here so that the
//! fingerprinting, history, caching and scheduling layers agree on a single
//! vocabulary.
//!
//! ## Key Components
//!
//! - **`errors`**: the umbrella `Error` enum, the `Result` alias and the
//!   per-concern error types (`GraphError`, `FingerprintError`, `ActionError`,
//!   `BuildFailure`).
//! - **`types`**: newtypes such as `WorkUnitId`, `ContentHash` and `CacheKey`,
//!   the declared input/output property model and per-invocation outcomes.
//! - **`events`**: execution events and the explicitly passed `EventEmitter`.
//! - **`constants`**: environment variable names and format versions.

pub mod constants;
pub mod errors;
pub mod events;
pub mod types;

pub use self::{
    constants::*,
    errors::{
        ActionError, BuildFailure, Error, FingerprintError, GraphError, Result, ResultExt,
        UnitFailure,
    },
    events::{EventEmitter, EventEnvelope, EventSubscriber, ExecutionEvent, LoggingSubscriber},
    types::*,
};
