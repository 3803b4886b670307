//! Build cache configuration

use crate::errors::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_REMOTE_MAX_RETRIES: usize = 2;

/// Which cache backends are used and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct CacheSettings {
    /// Master switch; when off no cache key is ever computed
    pub enabled: bool,
    pub local: LocalCacheSettings,
    pub remote: Option<RemoteCacheSettings>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            local: LocalCacheSettings::default(),
            remote: None,
        }
    }
}

impl CacheSettings {
    /// Settings with caching switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Local cache only, stored in `directory`
    pub fn local(directory: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            local: LocalCacheSettings {
                enabled: true,
                directory: Some(directory.into()),
                push: true,
            },
            remote: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(remote) = &self.remote {
            remote.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct LocalCacheSettings {
    pub enabled: bool,
    /// Defaults to `$XDG_CACHE_HOME/kiln/build-cache`
    pub directory: Option<PathBuf>,
    /// Whether new entries are written to the local cache
    pub push: bool,
}

impl Default for LocalCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            push: true,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RemoteCacheSettings {
    /// Base URL; entries live under `{url}/cache/{key}`
    pub url: String,
    /// Whether new entries are uploaded
    #[serde(default)]
    pub push: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_REMOTE_TIMEOUT_MS
}

fn default_max_retries() -> usize {
    DEFAULT_REMOTE_MAX_RETRIES
}

impl RemoteCacheSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            push: false,
            timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
            username: None,
            password: None,
            max_retries: DEFAULT_REMOTE_MAX_RETRIES,
        }
    }

    #[must_use]
    pub fn push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.url).map_err(|e| {
            CacheError::configuration(format!("invalid remote cache URL '{}': {e}", self.url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CacheError::configuration(format!(
                "remote cache URL '{}' must use http or https",
                self.url
            )));
        }
        if self.timeout_ms == 0 {
            return Err(CacheError::configuration(
                "remote cache timeout must be greater than zero",
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(CacheError::configuration(
                "remote cache password requires a username",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for RemoteCacheSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCacheSettings")
            .field("url", &self.url)
            .field("push", &self.push)
            .field("timeout_ms", &self.timeout_ms)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_local_cache_only() {
        let settings = CacheSettings::default();
        assert!(settings.enabled);
        assert!(settings.local.enabled);
        assert!(settings.local.push);
        assert!(settings.remote.is_none());
    }

    #[test]
    fn test_remote_settings_deserialize_with_defaults() {
        let settings: CacheSettings = serde_json::from_str(
            r#"{ "remote": { "url": "https://cache.example.com", "push": true } }"#,
        )
        .unwrap();
        let remote = settings.remote.unwrap();
        assert!(remote.push);
        assert_eq!(remote.timeout(), Duration::from_secs(30));
        assert_eq!(remote.max_retries, 2);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result: std::result::Result<CacheSettings, _> =
            serde_json::from_str(r#"{ "enabeld": false }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validation() {
        assert!(RemoteCacheSettings::new("https://cache.example.com")
            .validate()
            .is_ok());
        assert!(RemoteCacheSettings::new("ftp://cache.example.com")
            .validate()
            .is_err());
        assert!(RemoteCacheSettings::new("not a url").validate().is_err());

        let mut zero_timeout = RemoteCacheSettings::new("http://localhost:8080");
        zero_timeout.timeout_ms = 0;
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut settings = RemoteCacheSettings::new("http://localhost");
        settings.username = Some("ci".into());
        settings.password = Some("hunter2".into());
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
