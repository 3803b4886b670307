//! Storage backends for cache entries

mod http;
mod local;

pub use http::HttpBackend;
pub use local::LocalDirectoryBackend;

use crate::errors::{Result, StoreType};
use kiln_core::CacheKey;
use std::sync::Arc;

/// A place cache entries can be loaded from and stored to
#[async_trait::async_trait]
pub trait BuildCacheBackend: Send + Sync + std::fmt::Debug {
    fn store_type(&self) -> StoreType;

    /// Fetch the entry stored under `key`, if any
    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;

    /// Store `entry` under `key`, replacing any previous entry
    async fn store(&self, key: &CacheKey, entry: Arc<Vec<u8>>) -> Result<()>;
}
