//! Declared input and output properties of a work unit

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How paths are represented in a fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathNormalization {
    /// The absolute path is part of the identity
    Absolute,
    /// Only the root name and the path relative to the root matter, so the
    /// same content yields the same fingerprint wherever it lives
    #[default]
    Relative,
}

/// A named set of files and directories
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileCollection {
    pub roots: Vec<PathBuf>,
    /// Glob patterns a file must match, relative to its root. Empty means all.
    #[serde(default)]
    pub include: Vec<String>,
    /// Glob patterns excluding files and whole directories
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub normalization: PathNormalization,
}

impl FileCollection {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn single(root: impl Into<PathBuf>) -> Self {
        Self::new([root])
    }

    #[must_use]
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    #[must_use]
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    #[must_use]
    pub fn normalization(mut self, normalization: PathNormalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// A declared input property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum InputProperty {
    Files(FileCollection),
    Value(serde_json::Value),
}

/// Shape of a declared output location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TreeType {
    File,
    Directory,
}

/// A declared output property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLocation {
    pub path: PathBuf,
    pub tree: TreeType,
}

impl OutputLocation {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tree: TreeType::File,
        }
    }

    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tree: TreeType::Directory,
        }
    }

    /// Whether two locations share any path.
    ///
    /// Works on the declared paths lexically; callers are expected to declare
    /// absolute paths.
    pub fn overlaps(&self, other: &OutputLocation) -> bool {
        let (a, b) = (self.path.as_path(), other.path.as_path());
        if a == b {
            return true;
        }
        contains(self, b) || contains(other, a)
    }
}

fn contains(location: &OutputLocation, path: &Path) -> bool {
    location.tree == TreeType::Directory && path.starts_with(&location.path)
}
