use crate::fingerprint::{Fingerprint, FingerprintEntry};
use crate::hasher::hash_file;
use globset::{Glob, GlobSet, GlobSetBuilder};
use kiln_core::{
    ContentHash, FileCollection, FingerprintError, InputProperty, OutputLocation,
    PathNormalization,
};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

/// Computes fingerprints of declared properties.
///
/// Stateless: every call reads the filesystem as it is at call time. Callers
/// make sure nothing mutates the fingerprinted paths concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fingerprinter;

impl Fingerprinter {
    pub fn new() -> Self {
        Self
    }

    /// Fingerprint one input property
    pub fn fingerprint_property(
        &self,
        name: &str,
        property: &InputProperty,
    ) -> Result<Fingerprint, FingerprintError> {
        match property {
            InputProperty::Files(collection) => self.fingerprint_files(collection),
            InputProperty::Value(value) => self.fingerprint_value(name, value),
        }
    }

    /// Fingerprint every input property, keyed by property name
    pub fn fingerprint_inputs(
        &self,
        inputs: &BTreeMap<String, InputProperty>,
    ) -> Result<BTreeMap<String, Fingerprint>, FingerprintError> {
        inputs
            .iter()
            .map(|(name, property)| Ok((name.clone(), self.fingerprint_property(name, property)?)))
            .collect()
    }

    /// Fingerprint every output location, keyed by property name.
    ///
    /// Outputs are fingerprinted relative to their own location so that the
    /// digest describes what was produced, not where.
    pub fn fingerprint_outputs(
        &self,
        outputs: &BTreeMap<String, OutputLocation>,
    ) -> Result<BTreeMap<String, Fingerprint>, FingerprintError> {
        outputs
            .iter()
            .map(|(name, location)| Ok((name.clone(), self.fingerprint_output(location)?)))
            .collect()
    }

    pub fn fingerprint_output(
        &self,
        location: &OutputLocation,
    ) -> Result<Fingerprint, FingerprintError> {
        let collection = FileCollection::single(&location.path);
        self.fingerprint_files(&collection)
    }

    /// Fingerprint a scalar value from its canonical JSON form
    pub fn fingerprint_value(
        &self,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<Fingerprint, FingerprintError> {
        // serde_json maps are ordered by key, so this is canonical
        let bytes = serde_json::to_vec(value).map_err(|source| FingerprintError::Value {
            property: name.to_string(),
            source,
        })?;
        let mut fingerprint = Fingerprint::new();
        fingerprint.insert("", FingerprintEntry::value(ContentHash::of(bytes)));
        Ok(fingerprint)
    }

    /// Fingerprint a file collection.
    ///
    /// Empty collections yield an empty fingerprint; roots that do not exist
    /// are recorded as missing.
    pub fn fingerprint_files(
        &self,
        collection: &FileCollection,
    ) -> Result<Fingerprint, FingerprintError> {
        let filter = PathFilter::new(&collection.include, &collection.exclude)?;
        let mut fingerprint = Fingerprint::new();

        for (index, root) in collection.roots.iter().enumerate() {
            let keys = KeyScheme::new(root, index, collection.normalization, &fingerprint);
            visit_root(root, &keys, &filter, &mut fingerprint)?;
        }

        trace!(entries = fingerprint.len(), "Fingerprinted file collection");
        Ok(fingerprint)
    }
}

fn visit_root(
    root: &Path,
    keys: &KeyScheme,
    filter: &PathFilter,
    fingerprint: &mut Fingerprint,
) -> Result<(), FingerprintError> {
    let metadata = match std::fs::metadata(root) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fingerprint.insert(keys.root_key(), FingerprintEntry::missing());
            return Ok(());
        }
        Err(e) => return Err(FingerprintError::from_io(root, "inspect", e)),
    };

    if metadata.is_file() {
        fingerprint.insert(keys.root_key(), FingerprintEntry::file(hash_file(root)?));
        return Ok(());
    }

    fingerprint.insert(keys.root_key(), FingerprintEntry::directory());

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let relative = relative_path(root, entry.path());
            !filter.is_excluded(&relative)
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                match e.into_io_error() {
                    // Dangling symlink, or vanished between listing and reading
                    Some(io) if io.kind() == io::ErrorKind::NotFound => {
                        let relative = relative_path(root, &path);
                        if !relative.is_empty()
                            && !filter.is_excluded(&relative)
                            && filter.is_included(&relative)
                        {
                            fingerprint
                                .insert(keys.child_key(&relative), FingerprintEntry::missing());
                        }
                        continue;
                    }
                    Some(io) => return Err(FingerprintError::from_io(path, "walk", io)),
                    None => {
                        return Err(FingerprintError::from_io(
                            path,
                            "walk",
                            io::Error::new(io::ErrorKind::Other, "filesystem loop detected"),
                        ))
                    }
                }
            }
        };

        let relative = relative_path(root, entry.path());
        if entry.file_type().is_dir() {
            if filter.has_includes() {
                continue;
            }
            fingerprint.insert(keys.child_key(&relative), FingerprintEntry::directory());
        } else if filter.is_included(&relative) {
            fingerprint.insert(
                keys.child_key(&relative),
                FingerprintEntry::file(hash_file(entry.path())?),
            );
        }
    }

    Ok(())
}

/// Path relative to `root` with `/` separators
fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Maps paths under one root to fingerprint keys
struct KeyScheme {
    prefix: String,
    suffix: String,
}

impl KeyScheme {
    fn new(
        root: &Path,
        index: usize,
        normalization: PathNormalization,
        existing: &Fingerprint,
    ) -> Self {
        match normalization {
            PathNormalization::Absolute => Self {
                prefix: display_path(&absolute(root)),
                suffix: String::new(),
            },
            PathNormalization::Relative => {
                let prefix = root
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                // Two roots with the same name must not shadow each other
                let suffix = if existing.contains_key(&prefix) {
                    format!("#{index}")
                } else {
                    String::new()
                };
                Self { prefix, suffix }
            }
        }
    }

    fn root_key(&self) -> String {
        format!("{}{}", self.prefix, self.suffix)
    }

    fn child_key(&self, relative: &str) -> String {
        if self.prefix.is_empty() && self.suffix.is_empty() {
            relative.to_string()
        } else {
            format!("{}{}/{}", self.prefix, self.suffix, relative)
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Include/exclude glob patterns applied to root-relative paths
struct PathFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl PathFilter {
    fn new(include: &[String], exclude: &[String]) -> Result<Self, FingerprintError> {
        Ok(Self {
            include: build_glob_set(include)?,
            exclude: build_glob_set(exclude)?,
        })
    }

    fn has_includes(&self) -> bool {
        self.include.is_some()
    }

    fn is_included(&self, relative: &str) -> bool {
        self.include
            .as_ref()
            .map_or(true, |set| set.is_match(relative))
    }

    fn is_excluded(&self, relative: &str) -> bool {
        self.exclude
            .as_ref()
            .is_some_and(|set| set.is_match(relative))
    }
}

fn build_glob_set(patterns: &[String]) -> Result<Option<GlobSet>, FingerprintError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| FingerprintError::InvalidPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| FingerprintError::InvalidPattern {
            pattern: patterns.join(", "),
            message: e.to_string(),
        })
}
