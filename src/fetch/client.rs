//! HTTP Image Client
//!
//! Downloads thumbnail bytes with a plain GET request.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::errors::FetchError;
use super::ImageFetcher;
use crate::config::CacheConfig;

/// reqwest-backed fetcher
///
/// No overall request timeout is set here; bounding a fetch is the cache's
/// job (see `CacheConfig::fetch_timeout_secs`). Only the connect phase is
/// limited.
#[derive(Clone)]
pub struct HttpFetcher {
    /// HTTP client for making requests
    http_client: Client,
}

impl HttpFetcher {
    /// Build a fetcher from cache configuration
    pub fn new(config: &CacheConfig) -> Result<Self, FetchError> {
        let http_client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }

    /// Wrap an existing client
    pub fn with_client(http_client: Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }

        debug!(url = %url, "Downloading image");

        let response = self.http_client.get(url).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status, &body));
        }

        let bytes = response.bytes().await?;

        debug!(url = %url, size = bytes.len(), "Downloaded image");
        Ok(bytes.to_vec())
    }
}
