//! Content-system API surface: build listings and metadata endpoints

use crate::{CdnClient, Error, GOG_CDN, GOG_CONTENT_SYSTEM, Result, galaxy_path};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// One build offered for a (product, platform) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub build_id: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub generation: u32,
    /// Gen-1 builds carry their pre-Galaxy build id as well
    #[serde(default)]
    pub legacy_build_id: Option<serde_json::Value>,
    #[serde(default)]
    pub version_name: String,
    /// Link to the zlib-deflated product manifest
    pub link: String,
}

impl Build {
    /// Legacy build id rendered as a path component (Gen-1 secure links)
    pub fn legacy_build_id(&self) -> Option<String> {
        match &self.legacy_build_id {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Response of the builds listing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildsPage {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub items: Vec<Build>,
}

impl BuildsPage {
    /// Branch names seen across all offered builds (`None` = main branch)
    pub fn branches(&self) -> Vec<Option<String>> {
        let mut branches = vec![None];
        for item in &self.items {
            if let Some(branch) = &item.branch {
                if !branches.iter().any(|b| b.as_deref() == Some(branch.as_str())) {
                    branches.push(Some(branch.clone()));
                }
            }
        }
        branches
    }
}

/// Typed wrapper around the content-system endpoints the engine consumes
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: CdnClient,
}

impl ApiClient {
    pub fn new(client: CdnClient) -> Self {
        Self { client }
    }

    /// Underlying HTTP client
    pub fn http(&self) -> &CdnClient {
        &self.client
    }

    /// List builds for a product on a platform.
    ///
    /// A branch password unlocks password-protected branches; the endpoint
    /// takes its SHA-256 hex digest.
    pub async fn get_builds(
        &self,
        product_id: &str,
        platform: &str,
        generation: u32,
        branch_password: Option<&str>,
    ) -> Result<BuildsPage> {
        let mut url = format!(
            "{GOG_CONTENT_SYSTEM}/products/{product_id}/os/{platform}/builds?generation={generation}"
        );
        if let Some(password) = branch_password {
            let digest = Sha256::digest(password.as_bytes());
            url.push_str(&format!("&branch_password_sha256={}", hex::encode(digest)));
        }

        let page: BuildsPage = self.client.get_json(&url).await?;
        if page.items.is_empty() {
            return Err(Error::content_not_found(format!(
                "no builds for {product_id} on {platform}"
            )));
        }
        debug!(
            "{} builds for {} on {}",
            page.items.len(),
            product_id,
            platform
        );
        Ok(page)
    }

    /// Fetch and inflate a blob as JSON (product manifests follow build links)
    pub async fn get_zlib_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.client.get_zlib_json(url).await
    }
}

/// URL of a Gen-2 depot manifest blob
pub fn v2_meta_url(manifest_md5: &str) -> String {
    format!(
        "{GOG_CDN}/content-system/v2/meta/{}",
        galaxy_path(manifest_md5)
    )
}

/// URL of a Gen-2 dependency depot manifest blob
pub fn dependencies_meta_url(manifest_md5: &str) -> String {
    format!(
        "{GOG_CDN}/content-system/v2/dependencies/meta/{}",
        galaxy_path(manifest_md5)
    )
}

/// URL of a Gen-1 depot manifest document
pub fn v1_manifest_url(product_id: &str, platform: &str, timestamp: u64, manifest: &str) -> String {
    format!("{GOG_CDN}/content-system/v1/manifests/{product_id}/{platform}/{timestamp}/{manifest}")
}

/// URL of the shared dependency repository descriptor
pub fn dependencies_repository_url() -> String {
    format!("{GOG_CONTENT_SYSTEM}/dependencies/repository?generation=2")
}

/// URL of the patch listing between two builds
pub fn patches_url(product_id: &str, from_build_id: &str, to_build_id: &str) -> String {
    format!(
        "{GOG_CONTENT_SYSTEM}/products/{product_id}/patches?_version=4&from_build_id={from_build_id}&to_build_id={to_build_id}"
    )
}
