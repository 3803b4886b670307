//! Core error type definitions

use super::{ActionError, BuildFailure, FingerprintError, GraphError};
use std::path::PathBuf;

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for kiln operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid work graph; fatal before any unit runs
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A declared input or output could not be fingerprinted
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    /// A unit's action failed
    #[error("action failed: {0}")]
    Action(#[from] ActionError),

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// File system operations
    #[error("file system {operation} operation failed for '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}: {source}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// One or more units failed
    #[error(transparent)]
    BuildFailed(#[from] BuildFailure),

    /// The invocation was cancelled before all units finished
    #[error("build was cancelled")]
    Cancelled,
}
