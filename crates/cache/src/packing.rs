//! Cache entry format.
//!
//! An entry is a gzip-compressed tar archive holding `METADATA.json` first,
//! followed by one tree per output property: `tree-<name>` for a file output
//! and `tree-<name>/...` for a directory output.

use crate::errors::{CacheError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_core::{OriginMetadata, OutputLocation, TreeType, CACHE_ENTRY_FORMAT_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::trace;

const METADATA_ENTRY: &str = "METADATA.json";
const TREE_PREFIX: &str = "tree-";

/// Metadata stored with every cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryMetadata {
    pub format_version: u32,
    pub origin: OriginMetadata,
    pub trees: BTreeMap<String, TreeMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMetadata {
    pub tree: TreeType,
    /// False when the output did not exist after execution
    pub present: bool,
}

/// Pack the current content of `outputs` into an entry
pub fn pack(outputs: &BTreeMap<String, OutputLocation>, origin: OriginMetadata) -> Result<Vec<u8>> {
    let mut trees = BTreeMap::new();
    for (name, location) in outputs {
        trees.insert(
            name.clone(),
            TreeMetadata {
                tree: location.tree,
                present: output_present(name, location)?,
            },
        );
    }
    let metadata = CacheEntryMetadata {
        format_version: CACHE_ENTRY_FORMAT_VERSION,
        origin,
        trees,
    };
    let metadata_bytes = serde_json::to_vec_pretty(&metadata).map_err(|e| CacheError::Packing {
        reason: format!("failed to serialize metadata: {e}"),
    })?;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);

    let mut header = tar::Header::new_gnu();
    header.set_size(metadata_bytes.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, METADATA_ENTRY, metadata_bytes.as_slice())
        .map_err(packing_error)?;

    for (name, location) in outputs {
        if !metadata.trees[name].present {
            continue;
        }
        let entry_name = format!("{TREE_PREFIX}{name}");
        match location.tree {
            TreeType::File => builder
                .append_path_with_name(&location.path, &entry_name)
                .map_err(packing_error)?,
            TreeType::Directory => builder
                .append_dir_all(&entry_name, &location.path)
                .map_err(packing_error)?,
        }
    }

    let encoder = builder.into_inner().map_err(packing_error)?;
    let archive = encoder.finish().map_err(packing_error)?;
    trace!(bytes = archive.len(), "Packed cache entry");
    Ok(archive)
}

/// Replace the content of `outputs` with the trees stored in `archive`.
///
/// The archive is validated against the declared outputs before anything is
/// touched; once unpacking starts, each output location is cleared first.
pub fn unpack(
    archive: &[u8],
    outputs: &BTreeMap<String, OutputLocation>,
) -> Result<CacheEntryMetadata> {
    let mut tar_bytes = Vec::new();
    GzDecoder::new(archive)
        .read_to_end(&mut tar_bytes)
        .map_err(CacheError::corrupt)?;

    let metadata = read_metadata(&tar_bytes)?;
    validate_trees(&metadata, outputs)?;

    for (name, location) in outputs {
        clear_location(&location.path)?;
        let present = metadata.trees[name].present;
        let dir = match location.tree {
            TreeType::Directory if present => Some(location.path.as_path()),
            _ => location.path.parent(),
        };
        if let Some(dir) = dir {
            fs::create_dir_all(dir).map_err(|e| io_error(dir, "create output directory", e))?;
        }
    }

    let mut tar = tar::Archive::new(tar_bytes.as_slice());
    for entry in tar.entries().map_err(CacheError::corrupt)? {
        let mut entry = entry.map_err(CacheError::corrupt)?;
        let path = entry.path().map_err(CacheError::corrupt)?.into_owned();
        if path == Path::new(METADATA_ENTRY) {
            continue;
        }

        let target = resolve_target(&path, outputs)?;
        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| io_error(&target, "create output directory", e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| io_error(parent, "create output directory", e))?;
        }
        entry
            .unpack(&target)
            .map_err(|e| io_error(&target, "unpack output", e))?;
    }

    Ok(metadata)
}

fn read_metadata(tar_bytes: &[u8]) -> Result<CacheEntryMetadata> {
    let mut tar = tar::Archive::new(tar_bytes);
    let mut entries = tar.entries().map_err(CacheError::corrupt)?;
    let mut first = entries
        .next()
        .ok_or_else(|| CacheError::corrupt("archive is empty"))?
        .map_err(CacheError::corrupt)?;

    let first_path = first.path().map_err(CacheError::corrupt)?.into_owned();
    if first_path != Path::new(METADATA_ENTRY) {
        return Err(CacheError::corrupt("archive does not start with metadata"));
    }
    let mut bytes = Vec::new();
    first.read_to_end(&mut bytes).map_err(CacheError::corrupt)?;
    let metadata: CacheEntryMetadata =
        serde_json::from_slice(&bytes).map_err(CacheError::corrupt)?;

    if metadata.format_version != CACHE_ENTRY_FORMAT_VERSION {
        return Err(CacheError::corrupt(format!(
            "unsupported entry format version {}",
            metadata.format_version
        )));
    }
    Ok(metadata)
}

fn validate_trees(
    metadata: &CacheEntryMetadata,
    outputs: &BTreeMap<String, OutputLocation>,
) -> Result<()> {
    let matches = metadata.trees.len() == outputs.len()
        && outputs.iter().all(|(name, location)| {
            metadata
                .trees
                .get(name)
                .is_some_and(|tree| tree.tree == location.tree)
        });
    if matches {
        Ok(())
    } else {
        Err(CacheError::corrupt("entry does not match the declared outputs"))
    }
}

/// Map an archive path onto the declared output it belongs to
fn resolve_target(path: &Path, outputs: &BTreeMap<String, OutputLocation>) -> Result<PathBuf> {
    let mut components = path.components();
    let tree = match components.next() {
        Some(Component::Normal(first)) => first.to_string_lossy().into_owned(),
        _ => return Err(CacheError::corrupt(format!("unexpected entry '{}'", path.display()))),
    };
    let name = tree
        .strip_prefix(TREE_PREFIX)
        .ok_or_else(|| CacheError::corrupt(format!("unexpected entry '{}'", path.display())))?;
    let location = outputs
        .get(name)
        .ok_or_else(|| CacheError::corrupt(format!("unknown output property '{name}'")))?;

    let rest = components.as_path();
    if rest
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(CacheError::corrupt(format!(
            "entry '{}' escapes its output",
            path.display()
        )));
    }
    if rest.as_os_str().is_empty() {
        Ok(location.path.clone())
    } else if location.tree == TreeType::Directory {
        Ok(location.path.join(rest))
    } else {
        Err(CacheError::corrupt(format!(
            "file output '{name}' contains nested entry '{}'",
            path.display()
        )))
    }
}

fn output_present(name: &str, location: &OutputLocation) -> Result<bool> {
    match fs::metadata(&location.path) {
        Ok(metadata) => {
            let expected = match location.tree {
                TreeType::File => metadata.is_file(),
                TreeType::Directory => metadata.is_dir(),
            };
            if expected {
                Ok(true)
            } else {
                Err(CacheError::Packing {
                    reason: format!(
                        "output '{name}' at '{}' is not a {:?}",
                        location.path.display(),
                        location.tree
                    ),
                })
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error(&location.path, "inspect output", e)),
    }
}

fn clear_location(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| io_error(path, "clear output", e))
}

fn io_error(path: &Path, operation: &'static str, source: io::Error) -> CacheError {
    CacheError::Io {
        path: path.to_path_buf(),
        operation,
        source,
    }
}

fn packing_error(e: io::Error) -> CacheError {
    CacheError::Packing {
        reason: e.to_string(),
    }
}
