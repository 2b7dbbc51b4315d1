//! Secure-link acquisition and signed URL construction
//!
//! The content system hands out short-lived signed URL templates. A template
//! is a `url_format` with `{param}` placeholders plus a parameter map; the
//! path suffix of the requested object is appended to the `path` parameter
//! before substitution.

use crate::{CdnClient, Error, GOG_CONTENT_SYSTEM, Result, galaxy_path};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Maximum acquisition attempts before giving up
const MAX_ATTEMPTS: u32 = 10;

/// Initial backoff between acquisition attempts
const INITIAL_BACKOFF_MS: u64 = 200;

/// One CDN endpoint offered by a secure-link response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub endpoint_name: String,
    /// Signed URL template with `{param}` placeholders (product links)
    #[serde(default)]
    pub url_format: String,
    /// Pre-built base URL (dependency links)
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub supports_generation: Vec<u32>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Deserialize)]
struct SecureLinkResponse {
    urls: Vec<Endpoint>,
}

/// A signed link scoped to one product (or the dependency store)
#[derive(Debug, Clone)]
pub struct SecureLink {
    /// Product the link was issued for; `"redist"` for the dependency store
    pub product_id: String,
    endpoint: Endpoint,
}

impl SecureLink {
    /// Wrap an already-selected endpoint
    pub fn new(product_id: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            product_id: product_id.into(),
            endpoint,
        }
    }

    /// URL of a Gen-2 chunk or patch blob addressed by its compressed MD5
    pub fn chunk_url(&self, compressed_md5: &str) -> String {
        self.url_with_suffix(&format!("/{}", galaxy_path(compressed_md5)))
    }

    /// URL of the Gen-1 depot blob; byte ranges select individual files
    pub fn main_bin_url(&self) -> String {
        self.url_with_suffix("/main.bin")
    }

    /// The endpoint's URL without any suffix (installer blobs fetched by
    /// byte range)
    pub fn raw_url(&self) -> String {
        self.url_with_suffix("")
    }

    fn url_with_suffix(&self, suffix: &str) -> String {
        // Dependency links carry a ready URL instead of a template.
        if self.endpoint.url_format.is_empty() {
            return format!("{}{}", self.endpoint.url, suffix);
        }

        let mut parameters = self.endpoint.parameters.clone();
        let path = parameters
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        parameters.insert(
            "path".to_string(),
            serde_json::Value::String(format!("{path}{suffix}")),
        );
        merge_url_with_params(&self.endpoint.url_format, &parameters)
    }
}

/// Substitute `{key}` placeholders in a URL template
fn merge_url_with_params(format: &str, parameters: &HashMap<String, serde_json::Value>) -> String {
    let mut url = format.to_string();
    for (key, value) in parameters {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        url = url.replace(&format!("{{{key}}}"), &rendered);
    }
    url
}

/// Acquire a secure link for a product.
///
/// Retries with exponential backoff up to a hard cap; the first endpoint
/// offered is always used.
pub async fn fetch_secure_link(
    client: &CdnClient,
    product_id: &str,
    generation: u32,
) -> Result<SecureLink> {
    let url = format!(
        "{GOG_CONTENT_SYSTEM}/products/{product_id}/secure_link?_version=2&generation={generation}&path=/"
    );
    let endpoint = fetch_endpoint(client, &url, product_id).await?;
    Ok(SecureLink::new(product_id, endpoint))
}

/// Acquire a secure link rooted at a non-default store path (the patch
/// store lives under `/patches/store`)
pub async fn fetch_secure_link_at(
    client: &CdnClient,
    product_id: &str,
    generation: u32,
    root: &str,
) -> Result<SecureLink> {
    let url = format!(
        "{GOG_CONTENT_SYSTEM}/products/{product_id}/secure_link?_version=2&generation={generation}&path={root}"
    );
    let endpoint = fetch_endpoint(client, &url, product_id).await?;
    Ok(SecureLink::new(product_id, endpoint))
}

/// Acquire the secure link of the shared dependency store
pub async fn fetch_dependency_link(client: &CdnClient) -> Result<SecureLink> {
    let url = format!(
        "{GOG_CONTENT_SYSTEM}/open_link?generation=2&_version=2&path=/dependencies/store/"
    );
    let endpoint = fetch_endpoint(client, &url, "redist").await?;
    Ok(SecureLink::new("redist", endpoint))
}

async fn fetch_endpoint(client: &CdnClient, url: &str, product_id: &str) -> Result<Endpoint> {
    let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);

    for attempt in 1..=MAX_ATTEMPTS {
        match client.get_json::<SecureLinkResponse>(url).await {
            Ok(response) => {
                let endpoint = response
                    .urls
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::invalid_response("secure link offered no endpoints"))?;
                debug!(
                    "secure link for {} via endpoint {:?}",
                    product_id, endpoint.endpoint_name
                );
                return Ok(endpoint);
            }
            Err(e) if e.is_unauthorized() => return Err(e),
            Err(e) => {
                warn!(
                    "secure link attempt {}/{} for {} failed: {}",
                    attempt, MAX_ATTEMPTS, product_id, e
                );
                sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }
    }

    Err(Error::SecureLinkExhausted {
        product_id: product_id.to_string(),
        attempts: MAX_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product_endpoint() -> Endpoint {
        let mut parameters = HashMap::new();
        parameters.insert(
            "path".to_string(),
            serde_json::Value::String("/token/pid".to_string()),
        );
        parameters.insert(
            "expires".to_string(),
            serde_json::Value::Number(1234.into()),
        );
        Endpoint {
            endpoint_name: "fastly".to_string(),
            url_format: "https://cdn.example.com{path}?e={expires}".to_string(),
            url: String::new(),
            parameters,
            supports_generation: vec![2],
            priority: 10,
        }
    }

    #[test]
    fn test_chunk_url_substitution() {
        let link = SecureLink::new("1234", product_endpoint());
        let url = link.chunk_url("aabbccdd00112233445566778899aabb");
        assert_eq!(
            url,
            "https://cdn.example.com/token/pid/aa/bb/aabbccdd00112233445566778899aabb?e=1234"
        );
    }

    #[test]
    fn test_main_bin_url() {
        let link = SecureLink::new("1234", product_endpoint());
        assert_eq!(
            link.main_bin_url(),
            "https://cdn.example.com/token/pid/main.bin?e=1234"
        );
    }

    #[test]
    fn test_dependency_url_appends_to_base() {
        let endpoint = Endpoint {
            endpoint_name: "fastly".to_string(),
            url_format: String::new(),
            url: "https://cdn.example.com/dependencies/store".to_string(),
            parameters: HashMap::new(),
            supports_generation: vec![2],
            priority: 0,
        };
        let link = SecureLink::new("redist", endpoint);
        assert_eq!(
            link.chunk_url("aabbccdd00112233445566778899aabb"),
            "https://cdn.example.com/dependencies/store/aa/bb/aabbccdd00112233445566778899aabb"
        );
    }
}
