//! Implementation identity of a work unit's action

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the code that performs a unit's work.
///
/// Changing either part invalidates every previous execution of the unit and
/// changes its cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Implementation {
    pub type_name: String,
    pub version: String,
}

impl Implementation {
    pub fn new(type_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.type_name, self.version)
    }
}
