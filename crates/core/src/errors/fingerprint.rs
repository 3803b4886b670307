//! Errors raised while fingerprinting declared files

use std::io;
use std::path::PathBuf;

/// A declared input or output could not be read
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("permission denied while fingerprinting '{path}'")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to {operation} '{path}': {source}")]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("invalid file pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("failed to serialize value of property '{property}': {source}")]
    Value {
        property: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FingerprintError {
    /// Classify an I/O failure on `path`
    pub fn from_io(path: impl Into<PathBuf>, operation: &'static str, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::PermissionDenied {
            FingerprintError::PermissionDenied { path, source }
        } else {
            FingerprintError::Io {
                path,
                operation,
                source,
            }
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, FingerprintError::PermissionDenied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_is_classified() {
        let err = FingerprintError::from_io(
            "/secret",
            "read",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.is_permission_denied());

        let other = FingerprintError::from_io(
            "/disk",
            "read",
            io::Error::new(io::ErrorKind::Other, "bad sector"),
        );
        assert!(!other.is_permission_denied());
        assert_eq!(other.to_string(), "failed to read '/disk': bad sector");
    }
}
