//! Build configuration.
//!
//! Values are layered: built-in defaults, then an optional JSON file, then
//! `KILN_*` environment variables. [`ResolvedConfig`] remembers which layer
//! each overridden value came from.

use kiln_cache::{CacheSettings, RemoteCacheSettings};
use kiln_core::{
    DependencyInvalidation, Error, Result, ResultExt, DEFAULT_CANCELLATION_GRACE_MS,
    ENV_CACHE_REMOTE_PUSH, ENV_CACHE_REMOTE_URL, ENV_FAILURE_MODE, ENV_MAX_PARALLELISM, ENV_RERUN,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// What happens to the rest of the build once a unit fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// Stop dispatching new units; running units finish
    #[default]
    FailFast,
    /// Keep building everything that does not depend on a failed unit
    Continue,
}

impl FromStr for FailureMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "failfast" => Ok(Self::FailFast),
            "continue" => Ok(Self::Continue),
            other => Err(Error::configuration(format!(
                "unknown failure mode '{other}', expected 'fail-fast' or 'continue'"
            ))),
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FailFast => "fail-fast",
            Self::Continue => "continue",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct BuildConfig {
    /// Upper bound on concurrently running units
    pub max_parallelism: usize,
    pub failure_mode: FailureMode,
    pub dependency_invalidation: DependencyInvalidation,
    /// Ignore up-to-date state and execute every unit
    pub rerun_all: bool,
    /// How long running units may keep going after cancellation
    pub cancellation_grace_ms: u64,
    /// Overrides the per-workspace history location
    pub history_dir: Option<PathBuf>,
    pub cache: CacheSettings,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_parallelism(),
            failure_mode: FailureMode::default(),
            dependency_invalidation: DependencyInvalidation::default(),
            rerun_all: false,
            cancellation_grace_ms: DEFAULT_CANCELLATION_GRACE_MS,
            history_dir: None,
            cache: CacheSettings::default(),
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

impl BuildConfig {
    /// Load a configuration file, filling unset fields with defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_system(path, "read", e))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::json(format!("invalid build configuration '{}'", path.display()), e))
    }

    #[must_use]
    pub fn max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = max;
        self
    }

    #[must_use]
    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    #[must_use]
    pub fn dependency_invalidation(mut self, policy: DependencyInvalidation) -> Self {
        self.dependency_invalidation = policy;
        self
    }

    #[must_use]
    pub fn rerun_all(mut self, rerun: bool) -> Self {
        self.rerun_all = rerun;
        self
    }

    #[must_use]
    pub fn history_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.history_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }

    /// Apply `KILN_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<Vec<(&'static str, &'static str)>> {
        self.apply_overrides_from(std::env::vars())
    }

    /// Apply `KILN_*` overrides from `vars`.
    ///
    /// Returns the overridden fields together with the variable that set them.
    pub fn apply_overrides_from<I, K, V>(
        &mut self,
        vars: I,
    ) -> Result<Vec<(&'static str, &'static str)>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();
        let mut applied = Vec::new();

        if let Some(value) = vars.get(ENV_MAX_PARALLELISM) {
            self.max_parallelism = value.trim().parse().map_err(|_| {
                Error::configuration(format!(
                    "{ENV_MAX_PARALLELISM} must be a positive integer, got '{value}'"
                ))
            })?;
            applied.push(("max-parallelism", ENV_MAX_PARALLELISM));
        }
        if let Some(value) = vars.get(ENV_FAILURE_MODE) {
            self.failure_mode = value.parse()?;
            applied.push(("failure-mode", ENV_FAILURE_MODE));
        }
        if let Some(value) = vars.get(ENV_RERUN) {
            self.rerun_all = parse_flag(ENV_RERUN, value)?;
            applied.push(("rerun-all", ENV_RERUN));
        }
        if let Some(url) = vars.get(ENV_CACHE_REMOTE_URL) {
            match self.cache.remote.as_mut() {
                Some(remote) => remote.url = url.clone(),
                None => self.cache.remote = Some(RemoteCacheSettings::new(url.as_str())),
            }
            applied.push(("cache.remote.url", ENV_CACHE_REMOTE_URL));
        }
        if let Some(value) = vars.get(ENV_CACHE_REMOTE_PUSH) {
            let push = parse_flag(ENV_CACHE_REMOTE_PUSH, value)?;
            let Some(remote) = self.cache.remote.as_mut() else {
                return Err(Error::configuration(format!(
                    "{ENV_CACHE_REMOTE_PUSH} is set but no remote cache is configured"
                )));
            };
            remote.push = push;
            applied.push(("cache.remote.push", ENV_CACHE_REMOTE_PUSH));
        }

        for (field, var) in &applied {
            debug!(field, var, "Configuration overridden from environment");
        }
        Ok(applied)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallelism == 0 {
            return Err(Error::configuration("max-parallelism must be at least 1"));
        }
        self.cache
            .validate()
            .map_err(|e| Error::configuration(e.to_string()))
    }

    /// Defaults, then `file` if given, then the environment; validated
    pub fn resolve(file: Option<&Path>) -> Result<ResolvedConfig> {
        Self::resolve_with(file, std::env::vars())
    }

    pub fn resolve_with<I, K, V>(file: Option<&Path>, vars: I) -> Result<ResolvedConfig>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut sources = BTreeMap::new();
        let mut config = match file {
            Some(path) => {
                let config = Self::from_file(path).context("failed to load build configuration")?;
                for key in file_keys(path).context("failed to load build configuration")? {
                    sources.insert(key, ConfigSource::File(path.to_path_buf()));
                }
                config
            }
            None => Self::default(),
        };
        for (field, var) in config.apply_overrides_from(vars)? {
            sources.insert(field.to_string(), ConfigSource::Environment(var));
        }
        config.validate()?;
        Ok(ResolvedConfig { config, sources })
    }
}

fn parse_flag(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{var} must be a boolean, got '{value}'"
        ))),
    }
}

/// Top-level keys set in a configuration file
fn file_keys(path: &Path) -> Result<Vec<String>> {
    let content =
        std::fs::read_to_string(path).map_err(|e| Error::file_system(path, "read", e))?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    Ok(value
        .as_object()
        .map(|object| object.keys().cloned().collect())
        .unwrap_or_default())
}

/// Where a configuration value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    File(PathBuf),
    Environment(&'static str),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::File(path) => write!(f, "file '{}'", path.display()),
            Self::Environment(var) => write!(f, "environment variable {var}"),
        }
    }
}

/// A validated configuration and the origin of each overridden field
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: BuildConfig,
    sources: BTreeMap<String, ConfigSource>,
}

impl ResolvedConfig {
    /// Origin of a top-level field (kebab-case), or of a dotted cache field
    pub fn source(&self, field: &str) -> ConfigSource {
        self.sources
            .get(field)
            .cloned()
            .unwrap_or(ConfigSource::Default)
    }

    pub fn into_config(self) -> BuildConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BuildConfig::default();
        assert!(config.max_parallelism >= 1);
        assert_eq!(config.failure_mode, FailureMode::FailFast);
        assert_eq!(
            config.dependency_invalidation,
            DependencyInvalidation::OnExecution
        );
        assert_eq!(config.cancellation_grace(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_values_are_layered_under_environment() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("kiln.json");
        std::fs::write(
            &path,
            r#"{
                "max-parallelism": 2,
                "failure-mode": "continue",
                "dependency-invalidation": "on-output-change",
                "cache": { "local": { "push": false } }
            }"#,
        )
        .unwrap();

        let resolved = BuildConfig::resolve_with(
            Some(&path),
            [("KILN_MAX_PARALLELISM", "6"), ("UNRELATED", "x")],
        )
        .unwrap();
        assert_eq!(resolved.config.max_parallelism, 6);
        assert_eq!(resolved.config.failure_mode, FailureMode::Continue);
        assert_eq!(
            resolved.config.dependency_invalidation,
            DependencyInvalidation::OnOutputChange
        );
        assert!(!resolved.config.cache.local.push);

        assert_eq!(
            resolved.source("max-parallelism"),
            ConfigSource::Environment("KILN_MAX_PARALLELISM")
        );
        assert_eq!(resolved.source("failure-mode"), ConfigSource::File(path));
        assert_eq!(resolved.source("rerun-all"), ConfigSource::Default);
    }

    #[test]
    fn test_remote_cache_from_environment() {
        let mut config = BuildConfig::default();
        config
            .apply_overrides_from([
                ("KILN_CACHE_REMOTE_URL", "https://cache.example.com"),
                ("KILN_CACHE_REMOTE_PUSH", "true"),
                ("KILN_RERUN", "1"),
                ("KILN_FAILURE_MODE", "continue"),
            ])
            .unwrap();
        let remote = config.cache.remote.as_ref().unwrap();
        assert_eq!(remote.url, "https://cache.example.com");
        assert!(remote.push);
        assert!(config.rerun_all);
        assert_eq!(config.failure_mode, FailureMode::Continue);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = BuildConfig::default();
        assert!(config
            .apply_overrides_from([("KILN_MAX_PARALLELISM", "lots")])
            .is_err());
        assert!(config
            .apply_overrides_from([("KILN_FAILURE_MODE", "sometimes")])
            .is_err());
        assert!(config
            .apply_overrides_from([("KILN_CACHE_REMOTE_PUSH", "true")])
            .is_err());

        assert!(BuildConfig::default().max_parallelism(0).validate().is_err());

        let mut remote = BuildConfig::default();
        remote.cache.remote = Some(RemoteCacheSettings::new("ftp://cache"));
        assert!(remote.validate().is_err());
    }

    #[test]
    fn test_unreadable_config_file_is_a_configuration_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing.json");
        let error =
            BuildConfig::resolve_with(Some(&path), std::iter::empty::<(String, String)>())
                .unwrap_err();
        match error {
            Error::Configuration { message } => {
                assert!(message.starts_with("failed to load build configuration: "));
                assert!(message.contains("missing.json"), "{message}");
            }
            other => panic!("expected a configuration error, got {other:?}"),
        }

        std::fs::write(&path, r#"{ "max-parallelism": "many" }"#).unwrap();
        let error = BuildConfig::resolve_with(Some(&path), std::iter::empty::<(String, String)>())
            .unwrap_err();
        assert!(matches!(error, Error::Configuration { .. }), "{error:?}");
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result: std::result::Result<BuildConfig, _> =
            serde_json::from_str(r#"{ "max_parallelism": 4 }"#);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_process_environment_overrides() {
        std::env::set_var(ENV_MAX_PARALLELISM, "3");
        std::env::set_var(ENV_RERUN, "true");

        let mut config = BuildConfig::default();
        let applied = config.apply_env_overrides();

        std::env::remove_var(ENV_MAX_PARALLELISM);
        std::env::remove_var(ENV_RERUN);

        let applied = applied.unwrap();
        assert_eq!(config.max_parallelism, 3);
        assert!(config.rerun_all);
        assert!(applied.contains(&("max-parallelism", ENV_MAX_PARALLELISM)));
    }
}
