use crate::record::{ExecutionHistoryRecord, PersistedRecord};
use dashmap::DashMap;
use kiln_core::{ContentHash, Error, Result, WorkUnitId, HISTORY_FORMAT_VERSION};
use kiln_utils::{write_atomic, XdgPaths};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Durable per-workspace store of execution history records.
///
/// Each identity lives in its own file, replaced atomically, so a crash can
/// at worst lose the record being written and never corrupts another one.
/// Unreadable records are reported as absent.
#[derive(Debug)]
pub struct ExecutionHistoryStore {
    root: PathBuf,
    locks: DashMap<WorkUnitId, Arc<Mutex<()>>>,
}

impl ExecutionHistoryStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::file_system(&root, "create history directory", e))?;
        debug!(path = %root.display(), "Opened execution history store");
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    /// Open the default store of a workspace under the XDG state directory
    pub fn for_workspace(workspace_root: &Path) -> Result<Self> {
        Self::open(XdgPaths::history_dir(workspace_root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load the most recent record of `identity`
    pub fn load(&self, identity: &WorkUnitId) -> Option<ExecutionHistoryRecord> {
        let path = self.record_path(identity);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(unit = %identity, error = %e, "Execution history unreadable, treating as absent");
                return None;
            }
        };

        let persisted: PersistedRecord<'static> = match serde_json::from_slice(&bytes) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(unit = %identity, error = %e, "Execution history corrupted, treating as absent");
                return None;
            }
        };

        if persisted.version != HISTORY_FORMAT_VERSION {
            warn!(
                unit = %identity,
                found = persisted.version,
                expected = HISTORY_FORMAT_VERSION,
                "Execution history has an unsupported format version, treating as absent"
            );
            return None;
        }
        if &*persisted.identity != identity {
            warn!(unit = %identity, stored = %persisted.identity, "Execution history belongs to another unit");
            return None;
        }

        Some(persisted.record.into_owned())
    }

    /// Replace the record of `identity`
    pub fn store(&self, identity: &WorkUnitId, record: &ExecutionHistoryRecord) -> Result<()> {
        let content = serde_json::to_vec(&PersistedRecord::borrowed(identity, record))
            .map_err(|e| Error::json("failed to serialize execution history", e))?;

        let lock = self.lock_for(identity);
        let _guard = lock.lock();
        write_atomic(&self.record_path(identity), &content)?;
        debug!(unit = %identity, success = record.success, "Stored execution history");
        Ok(())
    }

    /// Forget the record of `identity`
    pub fn invalidate(&self, identity: &WorkUnitId) -> Result<()> {
        let path = self.record_path(identity);
        let lock = self.lock_for(identity);
        let _guard = lock.lock();
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(unit = %identity, "Invalidated execution history");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::file_system(path, "remove history record", e)),
        }
    }

    /// Forget every record
    pub fn clear(&self) -> Result<()> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| Error::file_system(&self.root, "list history directory", e))?;
        for entry in entries {
            let path = entry
                .map_err(|e| Error::file_system(&self.root, "list history directory", e))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path)
                    .map_err(|e| Error::file_system(&path, "remove history record", e))?;
            }
        }
        Ok(())
    }

    fn record_path(&self, identity: &WorkUnitId) -> PathBuf {
        let digest = ContentHash::of(identity.as_str());
        self.root.join(format!("{}.json", digest.as_str()))
    }

    fn lock_for(&self, identity: &WorkUnitId) -> Arc<Mutex<()>> {
        self.locks
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ExecutionOrigin;
    use kiln_core::{ContentHash, ExecutionOutcome, Implementation, InvocationId};
    use kiln_fingerprint::{Fingerprint, FingerprintEntry};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record(success: bool) -> ExecutionHistoryRecord {
        let mut fingerprint = Fingerprint::new();
        fingerprint.insert("src/a.txt", FingerprintEntry::file(ContentHash::of("a")));
        ExecutionHistoryRecord {
            implementation: Implementation::new("copy", "1"),
            inputs: BTreeMap::from([("sources".to_string(), fingerprint)]),
            outputs: BTreeMap::new(),
            upstream: None,
            cache_key: None,
            duration_ms: 12,
            success,
            origin: ExecutionOrigin::now(InvocationId::new(), ExecutionOutcome::Executed),
        }
    }

    #[test]
    fn test_store_and_load() {
        let temp = TempDir::new().unwrap();
        let store = ExecutionHistoryStore::open(temp.path()).unwrap();
        let id = WorkUnitId::from(":app:compile");

        assert!(store.load(&id).is_none());
        let stored = record(true);
        store.store(&id, &stored).unwrap();
        assert_eq!(store.load(&id), Some(stored));
    }

    #[test]
    fn test_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let id = WorkUnitId::from("a");
        ExecutionHistoryStore::open(temp.path())
            .unwrap()
            .store(&id, &record(false))
            .unwrap();

        let reopened = ExecutionHistoryStore::open(temp.path()).unwrap();
        assert!(!reopened.load(&id).unwrap().success);
    }

    #[test]
    fn test_corrupted_record_is_treated_as_absent() {
        let temp = TempDir::new().unwrap();
        let store = ExecutionHistoryStore::open(temp.path()).unwrap();
        let id = WorkUnitId::from("a");
        store.store(&id, &record(true)).unwrap();

        fs::write(store.record_path(&id), b"{ not json").unwrap();
        assert!(store.load(&id).is_none());

        // A fresh store after corruption works again
        store.store(&id, &record(true)).unwrap();
        assert!(store.load(&id).is_some());
    }

    #[test]
    fn test_unknown_format_version_is_treated_as_absent() {
        let temp = TempDir::new().unwrap();
        let store = ExecutionHistoryStore::open(temp.path()).unwrap();
        let id = WorkUnitId::from("a");
        store.store(&id, &record(true)).unwrap();

        let path = store.record_path(&id);
        let mut value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        value["version"] = serde_json::json!(HISTORY_FORMAT_VERSION + 1);
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        assert!(store.load(&id).is_none());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let temp = TempDir::new().unwrap();
        let store = ExecutionHistoryStore::open(temp.path()).unwrap();
        let (a, b) = (WorkUnitId::from("a"), WorkUnitId::from("b"));
        store.store(&a, &record(true)).unwrap();
        store.store(&b, &record(true)).unwrap();

        store.invalidate(&a).unwrap();
        store.invalidate(&a).unwrap();
        assert!(store.load(&a).is_none());
        assert!(store.load(&b).is_some());

        store.clear().unwrap();
        assert!(store.load(&b).is_none());
    }

    #[test]
    fn test_concurrent_writers_of_distinct_identities() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(ExecutionHistoryStore::open(temp.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let id = WorkUnitId::new(format!("unit-{i}"));
                    for _ in 0..10 {
                        store.store(&id, &record(true)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..8 {
            assert!(store.load(&WorkUnitId::new(format!("unit-{i}"))).is_some());
        }
    }
}
