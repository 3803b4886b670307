//! Build cache controller.
//!
//! Sits between the executor and the configured backends. Loads consult the
//! local directory first and the remote second; a remote hit is written
//! through to the local directory. Stores go to every backend with push
//! enabled. No backend failure ever escapes: each one is logged, counted and
//! turned into a miss or a skipped store.

use crate::backend::{BuildCacheBackend, HttpBackend, LocalDirectoryBackend};
use crate::config::CacheSettings;
use crate::errors::{Result, StoreType};
use crate::packing;
use crate::packing::CacheEntryMetadata;
use crate::stats::{CacheStats, CacheStatsSnapshot};
use dashmap::DashMap;
use kiln_core::{CacheKey, OriginMetadata, OutputLocation};
use kiln_utils::XdgPaths;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// An entry fetched from one of the backends
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub archive: Arc<Vec<u8>>,
    pub source: StoreType,
}

impl CachedEntry {
    /// Replace the content of `outputs` with this entry's trees
    pub fn unpack_into(
        &self,
        outputs: &BTreeMap<String, OutputLocation>,
    ) -> Result<CacheEntryMetadata> {
        packing::unpack(&self.archive, outputs)
    }
}

type InFlightLoad = Arc<OnceCell<Option<CachedEntry>>>;
type InFlightStore = Arc<OnceCell<()>>;

pub struct BuildCacheController {
    local: Option<Arc<dyn BuildCacheBackend>>,
    remote: Option<Arc<dyn BuildCacheBackend>>,
    push_local: bool,
    push_remote: bool,
    /// Set after the first remote failure; the remote is skipped from then on
    remote_disabled: AtomicBool,
    loads: DashMap<CacheKey, InFlightLoad>,
    stores: DashMap<CacheKey, InFlightStore>,
    stats: CacheStats,
}

impl std::fmt::Debug for BuildCacheController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCacheController")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("push_local", &self.push_local)
            .field("push_remote", &self.push_remote)
            .field("remote_disabled", &self.remote_disabled)
            .finish_non_exhaustive()
    }
}

impl BuildCacheController {
    /// A controller with no backends; every load misses
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    /// A controller over the given backends, pushing to both
    pub fn new(
        local: Option<Arc<dyn BuildCacheBackend>>,
        remote: Option<Arc<dyn BuildCacheBackend>>,
    ) -> Self {
        Self {
            push_local: local.is_some(),
            push_remote: remote.is_some(),
            local,
            remote,
            remote_disabled: AtomicBool::new(false),
            loads: DashMap::new(),
            stores: DashMap::new(),
            stats: CacheStats::new(),
        }
    }

    #[must_use]
    pub fn push_local(mut self, push: bool) -> Self {
        self.push_local = push && self.local.is_some();
        self
    }

    #[must_use]
    pub fn push_remote(mut self, push: bool) -> Self {
        self.push_remote = push && self.remote.is_some();
        self
    }

    /// Build a controller from configuration
    pub fn from_settings(settings: &CacheSettings) -> Result<Self> {
        settings.validate()?;
        if !settings.enabled {
            return Ok(Self::disabled());
        }

        let local: Option<Arc<dyn BuildCacheBackend>> = settings.local.enabled.then(|| {
            let directory = settings
                .local
                .directory
                .clone()
                .unwrap_or_else(XdgPaths::build_cache_dir);
            Arc::new(LocalDirectoryBackend::new(directory)) as Arc<dyn BuildCacheBackend>
        });
        let remote: Option<Arc<dyn BuildCacheBackend>> = match &settings.remote {
            Some(remote) => Some(Arc::new(HttpBackend::new(remote)?)),
            None => None,
        };
        let push_remote = settings.remote.as_ref().is_some_and(|r| r.push);

        Ok(Self::new(local, remote)
            .push_local(settings.local.push)
            .push_remote(push_remote))
    }

    /// Whether any backend is configured
    pub fn is_enabled(&self) -> bool {
        self.local.is_some() || self.remote.is_some()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Look an entry up, local first, then remote.
    ///
    /// Concurrent loads of the same key share a single backend round trip.
    pub async fn load(&self, key: &CacheKey) -> Option<CachedEntry> {
        if !self.is_enabled() {
            return None;
        }
        let cell = self.loads.entry(key.clone()).or_default().value().clone();
        let entry = cell.get_or_init(|| self.fetch(key)).await.clone();
        self.loads.remove_if(key, |_, current| Arc::ptr_eq(current, &cell));
        entry
    }

    async fn fetch(&self, key: &CacheKey) -> Option<CachedEntry> {
        if let Some(local) = &self.local {
            match local.load(key).await {
                Ok(Some(archive)) => {
                    debug!(%key, "Build cache hit in local cache");
                    self.stats.record_local_hit();
                    return Some(CachedEntry {
                        archive: Arc::new(archive),
                        source: StoreType::Local,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%key, "Failed to load entry from local build cache: {e}");
                    self.stats.record_error();
                }
            }
        }

        if let Some(remote) = self.active_remote() {
            match remote.load(key).await {
                Ok(Some(archive)) => {
                    debug!(%key, "Build cache hit in remote cache");
                    self.stats.record_remote_hit();
                    let archive = Arc::new(archive);
                    if self.push_local {
                        if let Some(local) = &self.local {
                            self.store_to(local.as_ref(), key, Arc::clone(&archive)).await;
                        }
                    }
                    return Some(CachedEntry {
                        archive,
                        source: StoreType::Remote,
                    });
                }
                Ok(None) => {}
                Err(e) => self.disable_remote(key, &e),
            }
        }

        debug!(%key, "Build cache miss");
        self.stats.record_miss();
        None
    }

    /// Pack `outputs` and store them under `key` in every pushing backend.
    ///
    /// A store of a key that is already being stored waits for that one to
    /// finish instead of packing again.
    pub async fn store(
        &self,
        key: &CacheKey,
        outputs: &BTreeMap<String, OutputLocation>,
        origin: OriginMetadata,
    ) {
        if !self.push_local && !self.push_remote {
            return;
        }
        let cell = self.stores.entry(key.clone()).or_default().value().clone();
        cell.get_or_init(|| self.pack_and_store(key, outputs, origin))
            .await;
        self.stores.remove_if(key, |_, current| Arc::ptr_eq(current, &cell));
    }

    async fn pack_and_store(
        &self,
        key: &CacheKey,
        outputs: &BTreeMap<String, OutputLocation>,
        origin: OriginMetadata,
    ) {
        let packed = {
            let outputs = outputs.clone();
            tokio::task::spawn_blocking(move || packing::pack(&outputs, origin)).await
        };
        match packed {
            Ok(Ok(archive)) => self.store_entry(key, Arc::new(archive)).await,
            Ok(Err(e)) => {
                warn!(%key, "Failed to pack outputs for the build cache: {e}");
                self.stats.record_error();
            }
            Err(e) => {
                warn!(%key, "Packing task for the build cache failed: {e}");
                self.stats.record_error();
            }
        }
    }

    /// Store an already packed entry in every pushing backend
    pub async fn store_entry(&self, key: &CacheKey, archive: Arc<Vec<u8>>) {
        if self.push_local {
            if let Some(local) = &self.local {
                self.store_to(local.as_ref(), key, Arc::clone(&archive)).await;
            }
        }
        if self.push_remote {
            if let Some(remote) = self.active_remote() {
                match remote.store(key, archive).await {
                    Ok(()) => {
                        debug!(%key, "Stored entry in remote build cache");
                        self.stats.record_store();
                    }
                    Err(e) => self.disable_remote(key, &e),
                }
            }
        }
    }

    async fn store_to(
        &self,
        backend: &dyn BuildCacheBackend,
        key: &CacheKey,
        archive: Arc<Vec<u8>>,
    ) {
        match backend.store(key, archive).await {
            Ok(()) => {
                debug!(%key, store = %backend.store_type(), "Stored entry in build cache");
                self.stats.record_store();
            }
            Err(e) => {
                warn!(
                    %key,
                    store = %backend.store_type(),
                    "Failed to store build cache entry: {e}"
                );
                self.stats.record_error();
            }
        }
    }

    fn active_remote(&self) -> Option<&Arc<dyn BuildCacheBackend>> {
        if self.remote_disabled.load(Ordering::Acquire) {
            None
        } else {
            self.remote.as_ref()
        }
    }

    fn disable_remote(&self, key: &CacheKey, error: &crate::errors::CacheError) {
        self.stats.record_error();
        if !self.remote_disabled.swap(true, Ordering::AcqRel) {
            warn!(
                %key,
                "Remote build cache failed, disabling it for the rest of the build: {error}"
            );
        } else {
            info!(%key, "Remote build cache failed: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalCacheSettings;
    use kiln_core::{ContentHash, InvocationId, WorkUnitId};
    use std::fs;
    use tempfile::TempDir;

    fn origin() -> OriginMetadata {
        OriginMetadata::new(WorkUnitId::new("compile"), InvocationId::new(), 12)
    }

    fn key(seed: &str) -> CacheKey {
        CacheKey::from_hash(ContentHash::of(seed))
    }

    #[tokio::test]
    async fn test_disabled_controller_always_misses() {
        let controller = BuildCacheController::from_settings(&CacheSettings::disabled()).unwrap();
        assert!(!controller.is_enabled());
        assert!(controller.load(&key("a")).await.is_none());
    }

    #[tokio::test]
    async fn test_store_then_load_restores_outputs() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let out = work.path().join("out.txt");
        fs::write(&out, "compiled").unwrap();
        let outputs = BTreeMap::from([("out".to_string(), OutputLocation::file(&out))]);

        let controller =
            BuildCacheController::from_settings(&CacheSettings::local(cache.path())).unwrap();
        controller.store(&key("a"), &outputs, origin()).await;
        fs::remove_file(&out).unwrap();

        let entry = controller.load(&key("a")).await.unwrap();
        assert_eq!(entry.source, StoreType::Local);
        let metadata = entry.unpack_into(&outputs).unwrap();
        assert_eq!(metadata.origin.identity.as_str(), "compile");
        assert_eq!(fs::read_to_string(&out).unwrap(), "compiled");

        let stats = controller.stats();
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.local_hits, 1);
    }

    #[tokio::test]
    async fn test_local_push_disabled_skips_store() {
        let cache = TempDir::new().unwrap();
        let settings = CacheSettings {
            local: LocalCacheSettings {
                enabled: true,
                directory: Some(cache.path().to_path_buf()),
                push: false,
            },
            ..CacheSettings::default()
        };
        let controller = BuildCacheController::from_settings(&settings).unwrap();
        controller.store(&key("a"), &BTreeMap::new(), origin()).await;
        assert!(controller.load(&key("a")).await.is_none());
        assert_eq!(controller.stats().misses, 1);
    }
}
