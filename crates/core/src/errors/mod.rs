//! Error types and result extensions for kiln operations

mod action;
mod builders;
mod extensions;
mod failure;
mod fingerprint;
mod graph;
mod types;

pub use action::ActionError;
pub use extensions::*;
pub use failure::{BuildFailure, UnitFailure};
pub use fingerprint::FingerprintError;
pub use graph::GraphError;
pub use types::{Error, Result};
