use kiln_core::ContentHash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Structural descriptor of a fingerprinted path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    RegularFile,
    Directory,
    Missing,
    Value,
}

impl EntryKind {
    fn tag(self) -> &'static str {
        match self {
            EntryKind::RegularFile => "f",
            EntryKind::Directory => "d",
            EntryKind::Missing => "m",
            EntryKind::Value => "v",
        }
    }
}

/// One fingerprinted path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub kind: EntryKind,
    /// Content digest; absent for directories and missing paths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<ContentHash>,
}

impl FingerprintEntry {
    pub fn file(digest: ContentHash) -> Self {
        Self {
            kind: EntryKind::RegularFile,
            digest: Some(digest),
        }
    }

    pub fn directory() -> Self {
        Self {
            kind: EntryKind::Directory,
            digest: None,
        }
    }

    pub fn missing() -> Self {
        Self {
            kind: EntryKind::Missing,
            digest: None,
        }
    }

    pub fn value(digest: ContentHash) -> Self {
        Self {
            kind: EntryKind::Value,
            digest: Some(digest),
        }
    }
}

/// How one path differs between two fingerprints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileChange {
    Added,
    Removed,
    Modified,
}

impl fmt::Display for FileChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileChange::Added => "added",
            FileChange::Removed => "removed",
            FileChange::Modified => "modified",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathChange {
    pub path: String,
    pub change: FileChange,
}

/// Content and structure digest of one property.
///
/// Entries are kept sorted by key, so equal filesystem states serialize to
/// identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint {
    entries: BTreeMap<String, FingerprintEntry>,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: FingerprintEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&FingerprintEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &FingerprintEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Single digest over every entry
    pub fn hash(&self) -> ContentHash {
        let mut hasher = Sha256::new();
        self.update(&mut hasher);
        ContentHash::finish(hasher)
    }

    fn update(&self, hasher: &mut Sha256) {
        for (key, entry) in &self.entries {
            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(entry.kind.tag().as_bytes());
            hasher.update([0]);
            if let Some(digest) = &entry.digest {
                hasher.update(digest.as_str().as_bytes());
            }
            hasher.update([0]);
        }
    }

    /// Per-path changes from `previous` to `self`, ordered by path
    pub fn diff(&self, previous: &Fingerprint) -> Vec<PathChange> {
        let keys: BTreeSet<&String> = self.entries.keys().chain(previous.entries.keys()).collect();
        keys.into_iter()
            .filter_map(|key| {
                let change = match (self.entries.get(key), previous.entries.get(key)) {
                    (Some(_), None) => FileChange::Added,
                    (None, Some(_)) => FileChange::Removed,
                    (Some(current), Some(before)) if current != before => FileChange::Modified,
                    _ => return None,
                };
                Some(PathChange {
                    path: key.clone(),
                    change,
                })
            })
            .collect()
    }
}

/// Combined digest over a set of named property fingerprints
pub fn hash_properties(properties: &BTreeMap<String, Fingerprint>) -> ContentHash {
    let mut hasher = Sha256::new();
    for (name, fingerprint) in properties {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(fingerprint.hash().as_str().as_bytes());
        hasher.update([0]);
    }
    ContentHash::finish(hasher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(entries: &[(&str, FingerprintEntry)]) -> Fingerprint {
        let mut fingerprint = Fingerprint::new();
        for (key, entry) in entries {
            fingerprint.insert(*key, entry.clone());
        }
        fingerprint
    }

    #[test]
    fn test_diff_is_sorted_and_classified() {
        let before = fp(&[
            ("src/a.rs", FingerprintEntry::file(ContentHash::of("a"))),
            ("src/b.rs", FingerprintEntry::file(ContentHash::of("b"))),
            ("src/c.rs", FingerprintEntry::file(ContentHash::of("c"))),
        ]);
        let after = fp(&[
            ("src/0.rs", FingerprintEntry::file(ContentHash::of("0"))),
            ("src/a.rs", FingerprintEntry::file(ContentHash::of("a"))),
            ("src/c.rs", FingerprintEntry::file(ContentHash::of("changed"))),
        ]);

        let changes = after.diff(&before);
        assert_eq!(
            changes,
            vec![
                PathChange {
                    path: "src/0.rs".into(),
                    change: FileChange::Added
                },
                PathChange {
                    path: "src/b.rs".into(),
                    change: FileChange::Removed
                },
                PathChange {
                    path: "src/c.rs".into(),
                    change: FileChange::Modified
                },
            ]
        );
    }

    #[test]
    fn test_kind_change_is_a_modification() {
        let before = fp(&[("out", FingerprintEntry::file(ContentHash::of("")))]);
        let after = fp(&[("out", FingerprintEntry::directory())]);
        assert_eq!(after.diff(&before)[0].change, FileChange::Modified);
        assert_ne!(before.hash(), after.hash());
    }

    #[test]
    fn test_missing_and_empty_differ() {
        let missing = fp(&[("in", FingerprintEntry::missing())]);
        assert_ne!(missing.hash(), Fingerprint::new().hash());
    }

    #[test]
    fn test_serialized_form_is_deterministic() {
        let a = fp(&[
            ("b", FingerprintEntry::directory()),
            ("a", FingerprintEntry::file(ContentHash::of("x"))),
        ]);
        let b = fp(&[
            ("a", FingerprintEntry::file(ContentHash::of("x"))),
            ("b", FingerprintEntry::directory()),
        ]);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_property_names_are_part_of_combined_hash() {
        let value = fp(&[("", FingerprintEntry::value(ContentHash::of("1")))]);
        let first = BTreeMap::from([("a".to_string(), value.clone())]);
        let second = BTreeMap::from([("b".to_string(), value)]);
        assert_ne!(hash_properties(&first), hash_properties(&second));
    }
}
