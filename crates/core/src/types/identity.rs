//! Identities of work units and build invocations

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// Stable identity of a work unit within a graph, e.g. `:app:compile`.
///
/// The identity is what the execution history is keyed by, so it must be
/// stable across invocations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkUnitId(String);

impl WorkUnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for WorkUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkUnitId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkUnitId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for WorkUnitId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for WorkUnitId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a single build invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_work_unit_id_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(WorkUnitId::from(":app:compile"), 1);
        assert_eq!(map.get(":app:compile"), Some(&1));
    }

    #[test]
    fn test_blank_identity_is_empty() {
        assert!(WorkUnitId::new("   ").is_empty());
        assert!(!WorkUnitId::new("a").is_empty());
    }

    #[test]
    fn test_invocation_ids_are_unique() {
        assert_ne!(InvocationId::new(), InvocationId::new());
    }
}
