use super::BuildCacheBackend;
use crate::config::RemoteCacheSettings;
use crate::errors::{CacheError, Result, StoreType};
use kiln_core::CacheKey;
use kiln_utils::{retry, RetryConfig};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::sync::Arc;
use tracing::trace;

/// Remote cache spoken to over plain HTTP.
///
/// `GET {url}/cache/{key}` answers 200 with the entry or 404 on a miss;
/// `PUT {url}/cache/{key}` stores one. Transient failures are retried with
/// exponential backoff before being reported.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    credentials: Option<(String, Option<String>)>,
    retry: RetryConfig,
}

impl HttpBackend {
    pub fn new(settings: &RemoteCacheSettings) -> Result<Self> {
        settings.validate()?;
        let client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|source| CacheError::Network {
                url: settings.url.clone(),
                source,
            })?;
        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            credentials: settings
                .username
                .clone()
                .map(|user| (user, settings.password.clone())),
            retry: RetryConfig::default().with_max_retries(settings.max_retries),
        })
    }

    fn entry_url(&self, key: &CacheKey) -> String {
        format!("{}/cache/{}", self.base_url, key)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, password.as_ref()),
            None => request,
        }
    }

    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let network = |source| CacheError::Network {
            url: url.to_string(),
            source,
        };
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(network)?;
        match response.status() {
            StatusCode::OK => {
                let bytes = response.bytes().await.map_err(network)?;
                Ok(Some(bytes.to_vec()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(CacheError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn upload(&self, url: &str, entry: Arc<Vec<u8>>) -> Result<()> {
        let response = self
            .authorize(self.client.put(url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(entry.as_ref().clone())
            .send()
            .await
            .map_err(|source| CacheError::Network {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(CacheError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait::async_trait]
impl BuildCacheBackend for HttpBackend {
    fn store_type(&self) -> StoreType {
        StoreType::Remote
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let url = self.entry_url(key);
        trace!(%url, "Fetching remote cache entry");
        retry(&self.retry, CacheError::is_transient, || self.fetch(&url)).await
    }

    async fn store(&self, key: &CacheKey, entry: Arc<Vec<u8>>) -> Result<()> {
        let url = self.entry_url(key);
        trace!(%url, bytes = entry.len(), "Uploading remote cache entry");
        retry(&self.retry, CacheError::is_transient, || {
            self.upload(&url, Arc::clone(&entry))
        })
        .await
    }
}
