//! Retrying HTTP client for CDN and content-system requests

use crate::{AuthProvider, Error, Result};
use flate2::read::ZlibDecoder;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

/// Default maximum retries for a single request
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default initial backoff in milliseconds
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 2_000;

/// Default maximum backoff in milliseconds
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Default backoff multiplier
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default jitter factor (0.0 to 1.0)
const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Default connection timeout
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default request timeout
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// HTTP client shared by all downloader workers and metadata fetches
#[derive(Clone)]
pub struct CdnClient {
    /// HTTP client with connection pooling
    client: Client,
    /// Token source for authenticated content-system endpoints
    auth: Option<Arc<dyn AuthProvider>>,
    /// Maximum number of retries
    max_retries: u32,
    /// Initial backoff duration in milliseconds
    initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds
    max_backoff_ms: u64,
    /// Backoff multiplier
    backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
}

impl std::fmt::Debug for CdnClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdnClient")
            .field("max_retries", &self.max_retries)
            .field("initial_backoff_ms", &self.initial_backoff_ms)
            .field("authenticated", &self.auth.is_some())
            .finish_non_exhaustive()
    }
}

impl CdnClient {
    /// Create a new client with default configuration
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create a builder for configuring the client
    pub fn builder() -> CdnClientBuilder {
        CdnClientBuilder::new()
    }

    /// Attach a token source for authenticated content-system requests
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Calculate backoff duration with exponential backoff and jitter
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base_backoff =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_backoff = base_backoff.min(self.max_backoff_ms as f64);

        let jitter_range = capped_backoff * self.jitter_factor;
        let jitter = rand::random::<f64>() * 2.0 * jitter_range - jitter_range;
        let final_backoff = (capped_backoff + jitter).max(0.0) as u64;

        Duration::from_millis(final_backoff)
    }

    /// Execute a request with retry logic
    async fn execute_with_retry(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        authenticated: bool,
    ) -> Result<Response> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.calculate_backoff(attempt - 1);
                debug!("retry attempt {} after {:?} backoff", attempt, backoff);
                sleep(backoff).await;
            }

            trace!("GET {} (attempt {})", url, attempt + 1);

            let mut request = self.client.get(url);
            if let Some((offset, size)) = range {
                request = request.header(
                    "Range",
                    format!("bytes={}-{}", offset, offset + size - 1),
                );
            }
            if authenticated {
                if let Some(token) = self.auth.as_ref().and_then(|a| a.bearer_token()) {
                    request = request.header("Authorization", format!("Bearer {token}"));
                }
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status == StatusCode::UNAUTHORIZED {
                        return Err(Error::unauthorized(url));
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.max_retries {
                        let retry_after = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(60);
                        warn!(
                            "rate limited (attempt {}): retry after {}s",
                            attempt + 1,
                            retry_after
                        );
                        last_error = Some(Error::RateLimited {
                            retry_after_secs: retry_after,
                        });
                        continue;
                    }

                    if status.is_server_error() && attempt < self.max_retries {
                        warn!("server error {} (attempt {}), will retry", status, attempt + 1);
                        last_error = Some(Error::Http(response.error_for_status().unwrap_err()));
                        continue;
                    }

                    if status == StatusCode::NOT_FOUND {
                        return Err(Error::content_not_found(url));
                    }

                    return Err(Error::Http(response.error_for_status().unwrap_err()));
                }
                Err(e) => {
                    let is_retryable = e.is_connect() || e.is_timeout() || e.is_request();
                    if is_retryable && attempt < self.max_retries {
                        warn!("request failed (attempt {}): {}, will retry", attempt + 1, e);
                        last_error = Some(Error::Http(e));
                    } else {
                        return Err(Error::Http(e));
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::invalid_response("All retry attempts failed")))
    }

    /// Plain GET without authentication (CDN blobs, secure-link URLs)
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.execute_with_retry(url, None, false).await
    }

    /// GET a byte range of a blob (`Range: bytes=offset-(offset+size-1)`)
    pub async fn get_range(&self, url: &str, offset: u64, size: u64) -> Result<Response> {
        self.execute_with_retry(url, Some((offset, size)), false)
            .await
    }

    /// GET an authenticated content-system endpoint
    pub async fn get_authed(&self, url: &str) -> Result<Response> {
        self.execute_with_retry(url, None, true).await
    }

    /// GET and buffer the full body
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.get(url).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// GET an authenticated endpoint and parse the body as JSON
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.get_authed(url).await?;
        Ok(response.json().await?)
    }

    /// GET a blob that is either zlib-deflated JSON or raw JSON.
    ///
    /// Gen-2 metadata is always zlib-wrapped; Gen-1 manifests may be raw, so
    /// inflation failure falls back to parsing the body as-is.
    pub async fn get_zlib_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let body = self.get_bytes(url).await?;
        Ok(serde_json::from_slice(&inflate_or_raw(body))?)
    }
}

/// Inflate a zlib stream, or hand back the input when it is not one
fn inflate_or_raw(body: Vec<u8>) -> Vec<u8> {
    let mut decoder = ZlibDecoder::new(body.as_slice());
    let mut inflated = Vec::new();
    match decoder.read_to_end(&mut inflated) {
        Ok(_) => inflated,
        Err(_) => body,
    }
}

/// Builder for configuring the CDN client
#[derive(Debug, Clone)]
pub struct CdnClientBuilder {
    connect_timeout_secs: u64,
    request_timeout_secs: u64,
    pool_max_idle_per_host: usize,
    max_retries: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    backoff_multiplier: f64,
    jitter_factor: f64,
}

impl CdnClientBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            pool_max_idle_per_host: 20,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }

    /// Set connection timeout
    pub fn connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Set request timeout
    pub fn request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Set maximum retries
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set initial backoff in milliseconds
    pub fn initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    /// Set maximum backoff in milliseconds
    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Build the client
    pub fn build(self) -> Result<CdnClient> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .build()?;

        Ok(CdnClient {
            client,
            auth: None,
            max_retries: self.max_retries,
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            backoff_multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor,
        })
    }
}

impl Default for CdnClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
