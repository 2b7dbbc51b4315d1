//! Binary-delta patch manifests
//!
//! Between two Gen-2 builds the content system may offer xdelta3 deltas per
//! changed file. The patch listing carries a link to a zlib-deflated manifest
//! whose depots mirror the product manifest's depot structure; each item
//! binds a source file hash to a target hash and the chunks of the delta
//! blob itself.

use crate::{Result, languages, normalize_path, v2::Chunk};
use galaxy_cdn::ApiClient;
use galaxy_cdn::api::{patches_url, v2_meta_url};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct PatchPointer {
    #[serde(default)]
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PatchManifestDoc {
    #[serde(default)]
    algorithm: String,
    #[serde(default)]
    depots: Vec<PatchDepot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchDepot {
    #[serde(deserialize_with = "crate::de_id")]
    product_id: String,
    #[serde(default)]
    languages: Vec<String>,
    manifest: String,
}

#[derive(Debug, Deserialize)]
struct PatchDepotDoc {
    depot: PatchDepotBody,
}

#[derive(Debug, Deserialize)]
struct PatchDepotBody {
    items: Vec<PatchItemRaw>,
}

#[derive(Debug, Deserialize)]
struct PatchItemRaw {
    #[serde(default)]
    path_source: String,
    #[serde(default)]
    path_target: String,
    #[serde(default)]
    md5_source: String,
    #[serde(default)]
    md5_target: String,
    #[serde(default)]
    chunks: Vec<Chunk>,
}

/// One applicable delta: patches the file at `path` from `md5_source`
/// to `md5_target` using the blob described by `chunks`
#[derive(Debug, Clone)]
pub struct PatchItem {
    pub product_id: String,
    pub path: String,
    pub md5_source: String,
    pub md5_target: String,
    /// Chunks of the delta blob, fetched like regular Gen-2 chunks from the
    /// product's patch secure link
    pub chunks: Vec<Chunk>,
}

impl PatchItem {
    /// Total download size of the delta blob
    pub fn download_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.compressed_size).sum()
    }
}

/// Fetch the patch items between two builds, or `None` when the service
/// offers no delta path (full redownload of changed files instead).
pub async fn fetch_patches(
    api: &ApiClient,
    product_id: &str,
    from_build_id: &str,
    to_build_id: &str,
    language: &str,
    dlc_ids: &[String],
) -> Result<Option<Vec<PatchItem>>> {
    let url = patches_url(product_id, from_build_id, to_build_id);
    let pointer: PatchPointer = match api.http().get_json(&url).await {
        Ok(pointer) => pointer,
        Err(galaxy_cdn::Error::ContentNotFound { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let Some(link) = pointer.link else {
        return Ok(None);
    };

    let doc: PatchManifestDoc = api.get_zlib_json(&link).await?;
    if doc.algorithm != "xdelta3" {
        info!("ignoring patch manifest with algorithm {:?}", doc.algorithm);
        return Ok(None);
    }

    let mut items = Vec::new();
    for depot in &doc.depots {
        let included = depot.product_id == product_id || dlc_ids.contains(&depot.product_id);
        if !included || !languages::depot_matches_language(&depot.languages, language) {
            continue;
        }
        let depot_doc: PatchDepotDoc = api.get_zlib_json(&v2_meta_url(&depot.manifest)).await?;
        for raw in depot_doc.depot.items {
            // Renames across a patch are not exercised by the service; only
            // same-path deltas are applied.
            if !raw.path_source.is_empty() && raw.path_source != raw.path_target {
                continue;
            }
            items.push(PatchItem {
                product_id: depot.product_id.clone(),
                path: normalize_path(&raw.path_target),
                md5_source: raw.md5_source,
                md5_target: raw.md5_target,
                chunks: raw.chunks,
            });
        }
    }

    debug!(
        "{} applicable patch items between {} and {}",
        items.len(),
        from_build_id,
        to_build_id
    );
    Ok(Some(items))
}
