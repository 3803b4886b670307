//! Build cache for kiln.
//!
//! A unit's outputs are packed into a single archive addressed by a
//! [`CacheKey`](kiln_core::CacheKey) derived from its implementation and
//! input fingerprints. The [`BuildCacheController`] looks entries up in a
//! local directory first and an optional HTTP remote second, and degrades
//! every backend failure to a miss or a skipped store.

pub mod backend;
pub mod config;
pub mod controller;
pub mod errors;
pub mod key;
pub mod packing;
pub mod server;
pub mod stats;

pub use backend::{BuildCacheBackend, HttpBackend, LocalDirectoryBackend};
pub use config::{CacheSettings, LocalCacheSettings, RemoteCacheSettings};
pub use controller::{BuildCacheController, CachedEntry};
pub use errors::{CacheError, Result, StoreType};
pub use key::{CacheKeyBuilder, CacheKeyInputs};
pub use packing::{CacheEntryMetadata, TreeMetadata};
pub use stats::{CacheStats, CacheStatsSnapshot};
