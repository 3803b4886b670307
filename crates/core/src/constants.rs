//! Shared constants

/// Application name, used for XDG directories
pub const APP_NAME: &str = "kiln";

/// Environment variable overriding the maximum number of concurrently running units
pub const ENV_MAX_PARALLELISM: &str = "KILN_MAX_PARALLELISM";

/// Environment variable selecting the failure mode (`fail-fast` or `continue`)
pub const ENV_FAILURE_MODE: &str = "KILN_FAILURE_MODE";

/// Environment variable setting the remote build cache URL
pub const ENV_CACHE_REMOTE_URL: &str = "KILN_CACHE_REMOTE_URL";

/// Environment variable enabling pushes to the remote build cache
pub const ENV_CACHE_REMOTE_PUSH: &str = "KILN_CACHE_REMOTE_PUSH";

/// Environment variable forcing every unit to be re-executed
pub const ENV_RERUN: &str = "KILN_RERUN";

/// Version of the persisted execution history record format
pub const HISTORY_FORMAT_VERSION: u32 = 1;

/// Version of the build cache entry format, folded into every cache key
pub const CACHE_ENTRY_FORMAT_VERSION: u32 = 1;

/// Default grace period granted to running units after cancellation (ms)
pub const DEFAULT_CANCELLATION_GRACE_MS: u64 = 5_000;

/// Capacity of the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;
