use kiln_core::{ContentHash, APP_NAME};
use std::env;
use std::path::{Path, PathBuf};

/// XDG Base Directory paths for kiln
pub struct XdgPaths;

impl XdgPaths {
    /// Get XDG_STATE_HOME/kiln or fallback
    pub fn state_dir() -> PathBuf {
        Self::base("XDG_STATE_HOME", ".local/state").join(APP_NAME)
    }

    /// Get XDG_CACHE_HOME/kiln or fallback
    pub fn cache_dir() -> PathBuf {
        Self::base("XDG_CACHE_HOME", ".cache").join(APP_NAME)
    }

    /// Execution history directory for one workspace.
    ///
    /// Keyed by a digest of the canonical workspace root so that each
    /// workspace keeps its own history regardless of process.
    pub fn history_dir(workspace_root: &Path) -> PathBuf {
        let root = workspace_root
            .canonicalize()
            .unwrap_or_else(|_| workspace_root.to_path_buf());
        let digest = ContentHash::of(root.to_string_lossy().as_bytes());
        Self::state_dir().join("history").join(digest.as_str())
    }

    /// Default local build cache directory
    pub fn build_cache_dir() -> PathBuf {
        Self::cache_dir().join("build-cache")
    }

    fn base(variable: &str, fallback: &str) -> PathBuf {
        env::var_os(variable)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|home| home.join(fallback))
                    .unwrap_or_else(|| PathBuf::from(fallback))
            })
    }
}
