//! HTTP client for fetching GTFS-realtime snapshots from the operator.

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL},
    Client, StatusCode,
};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Feed request timed out")]
    Timeout,
    #[error("Connection to feed failed: {0}")]
    ConnectionRefused(#[source] reqwest::Error),
    #[error("Feed returned error status: {0}")]
    HttpStatus(StatusCode),
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("Invalid API key header: {0}")]
    InvalidHeader(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::ConnectionRefused(e)
        } else {
            Self::Request(e)
        }
    }
}

/// Anything that can produce one raw feed snapshot per call.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, FetchError>;
}

/// Configuration for the feed client.
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// Vehicle positions endpoint
    pub url: String,
    /// Operator API key
    pub api_key: String,
    /// Header the API key is sent in
    pub api_key_header: String,
    /// Request timeout
    pub timeout: Duration,
}

impl FeedClientConfig {
    pub fn new(url: String, api_key: String) -> Self {
        Self {
            url,
            api_key,
            api_key_header: "api_key".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_api_key_header(mut self, header: String) -> Self {
        self.api_key_header = header;
        self
    }
}

/// Client for the operator's vehicle positions feed.
///
/// Each [`fetch`](FeedSource::fetch) is a single GET; retrying is left to the
/// scheduler.
pub struct FeedClient {
    client: Client,
    url: String,
}

impl FeedClient {
    pub fn new(config: FeedClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();

        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/x-protobuf, application/octet-stream, */*"),
        );
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let name = HeaderName::from_bytes(config.api_key_header.as_bytes())
            .map_err(|_| FetchError::InvalidHeader(config.api_key_header.clone()))?;
        let mut value = HeaderValue::from_str(config.api_key.trim())
            .map_err(|_| FetchError::InvalidHeader(config.api_key_header.clone()))?;
        value.set_sensitive(true);
        headers.insert(name, value);

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("transitgaze/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(FetchError::Request)?;

        Ok(Self {
            client,
            url: config.url,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FeedSource for FeedClient {
    async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        tracing::debug!("Fetching: {}", self.url);

        let response = self.client.get(&self.url).send().await?;

        match response.status() {
            status if status.is_success() => {
                let bytes = response.bytes().await?;
                Ok(bytes.to_vec())
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);

                Err(FetchError::RateLimited { retry_after })
            }
            status => Err(FetchError::HttpStatus(status)),
        }
    }
}
