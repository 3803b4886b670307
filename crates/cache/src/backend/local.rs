use super::BuildCacheBackend;
use crate::errors::{CacheError, Result, StoreType};
use kiln_core::CacheKey;
use kiln_utils::write_atomic;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Content-addressed directory of cache entries.
///
/// Entries live at `<root>/<first two hex chars>/<key>` to keep directory
/// sizes bounded. Writes go through a temporary file and a rename, so a
/// concurrent reader never sees a partial entry.
#[derive(Debug, Clone)]
pub struct LocalDirectoryBackend {
    root: PathBuf,
}

impl LocalDirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.shard()).join(key.as_str())
    }
}

#[async_trait::async_trait]
impl BuildCacheBackend for LocalDirectoryBackend {
    fn store_type(&self) -> StoreType {
        StoreType::Local
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                trace!(%key, bytes = bytes.len(), "Local cache hit");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io {
                path,
                operation: "read entry",
                source,
            }),
        }
    }

    async fn store(&self, key: &CacheKey, entry: Arc<Vec<u8>>) -> Result<()> {
        let path = self.entry_path(key);
        tokio::task::spawn_blocking(move || write_atomic(&path, &entry))
            .await?
            .map_err(CacheError::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::ContentHash;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_then_load_uses_sharded_layout() {
        let temp = TempDir::new().unwrap();
        let backend = LocalDirectoryBackend::new(temp.path());
        let key = CacheKey::from_hash(ContentHash::of("entry"));

        assert!(backend.load(&key).await.unwrap().is_none());
        backend
            .store(&key, Arc::new(b"archive".to_vec()))
            .await
            .unwrap();

        assert_eq!(backend.load(&key).await.unwrap(), Some(b"archive".to_vec()));
        assert!(temp.path().join(key.shard()).join(key.as_str()).is_file());
    }
}
