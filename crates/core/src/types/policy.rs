//! Dependency invalidation policy

use serde::{Deserialize, Serialize};

/// Decides whether a dependency's activity invalidates its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyInvalidation {
    /// Only the unit's own inputs, outputs and implementation are compared
    Never,
    /// The digest over every dependency's output fingerprint is compared and
    /// folded into the cache key
    OnOutputChange,
    /// As `OnOutputChange`, and a dependency that executed or was loaded from
    /// cache in the current invocation invalidates its dependents
    #[default]
    OnExecution,
}

impl DependencyInvalidation {
    pub fn tracks_upstream(self) -> bool {
        !matches!(self, Self::Never)
    }
}
