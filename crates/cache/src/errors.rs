//! Error types for the build cache.
//!
//! None of these ever fail a build: the controller logs them and degrades to
//! a miss or a skipped store.

use std::fmt;
use std::path::PathBuf;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Which backend an operation was talking to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Local,
    Remote,
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreType::Local => "local",
            StoreType::Remote => "remote",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// I/O errors during cache operations
    #[error("cache I/O failed during {operation} of '{path}': {source}")]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Writing an entry through the atomic file layer failed
    #[error("failed to write cache entry: {0}")]
    Write(#[source] kiln_core::Error),

    /// Transport-level failure talking to the remote cache
    #[error("remote cache request to '{url}' failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The remote cache answered with an unexpected status
    #[error("remote cache answered {status} for '{url}'")]
    UnexpectedStatus { url: String, status: u16 },

    /// The entry could not be decoded or does not match the declared outputs
    #[error("cache entry is corrupt: {reason}")]
    CorruptEntry { reason: String },

    /// Outputs could not be packed into an entry
    #[error("failed to pack outputs: {reason}")]
    Packing { reason: String },

    /// Invalid cache configuration
    #[error("invalid cache configuration: {message}")]
    Configuration { message: String },

    /// A blocking cache task panicked or was cancelled
    #[error("background cache task failed: {0}")]
    Background(#[from] tokio::task::JoinError),
}

impl CacheError {
    #[must_use]
    pub fn corrupt(reason: impl fmt::Display) -> Self {
        CacheError::CorruptEntry {
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        CacheError::Configuration {
            message: message.into(),
        }
    }

    /// Whether retrying the same request might succeed
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Network { source, .. } => source.is_timeout() || source.is_connect(),
            CacheError::UnexpectedStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_transient() {
        let busy = CacheError::UnexpectedStatus {
            url: "http://cache/cache/ab".into(),
            status: 503,
        };
        let forbidden = CacheError::UnexpectedStatus {
            url: "http://cache/cache/ab".into(),
            status: 403,
        };
        assert!(busy.is_transient());
        assert!(!forbidden.is_transient());
        assert!(!CacheError::corrupt("truncated").is_transient());
    }
}
