//! Gen-1 product and depot manifests
//!
//! Gen-1 depots ship a single uncompressed `main.bin` blob per depot; files
//! are byte ranges inside it, verified by an MD5 over the raw bytes. Depot
//! manifests are plain JSON documents addressed by product, platform and
//! build timestamp.

use crate::{Error, FileList, Result, languages, normalize_path, v2::SizeInfo};
use galaxy_cdn::ApiClient;
use galaxy_cdn::api::v1_manifest_url;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// A file inside a Gen-1 depot: a byte range of `main.bin`
#[derive(Debug, Clone)]
pub struct File {
    pub product_id: String,
    pub path: String,
    /// Byte offset inside the depot blob
    pub offset: u64,
    pub size: u64,
    /// MD5 over the raw (uncompressed) bytes
    pub hash: String,
    pub support: bool,
    pub executable: bool,
}

/// A depot referenced by a Gen-1 product manifest
#[derive(Debug, Clone)]
pub struct Depot {
    pub game_ids: Vec<String>,
    pub languages: Vec<String>,
    pub size: u64,
    pub manifest: String,
}

impl Depot {
    /// Whether this depot serves the target language
    pub fn matches_language(&self, target: &str) -> bool {
        languages::depot_matches_language(&self.languages, target)
    }
}

#[derive(Debug, Deserialize)]
struct DepotManifestDoc {
    depot: DepotManifestBody,
}

#[derive(Debug, Deserialize)]
struct DepotManifestBody {
    files: Vec<serde_json::Value>,
}

/// A parsed Gen-1 product manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Raw manifest document, persisted verbatim after a successful run
    data: serde_json::Value,
    pub platform: String,
    pub product_id: String,
    pub install_directory: String,
    pub timestamp: u64,
    pub language: String,
    pub dlcs: Vec<String>,
    /// Redistributable ids declared inline in the depot table
    pub dependencies: Vec<String>,
    pub depots: Vec<Depot>,
    pub all_depots: Vec<Depot>,
}

impl Manifest {
    /// Parse a product manifest for a platform, language and DLC selection
    pub fn new(
        meta: serde_json::Value,
        platform: &str,
        language: &str,
        dlcs: Vec<String>,
        dlc_only: bool,
    ) -> Result<Self> {
        let product = meta
            .get("product")
            .ok_or_else(|| Error::invalid_manifest("missing product object"))?;
        let product_id = crate::v2::id_field(product, "rootGameID")?;
        let install_directory = product
            .get("installDirectory")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid_manifest("missing installDirectory"))?
            .to_string();
        let timestamp = product
            .get("timestamp")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);

        let raw_depots = product
            .get("depots")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::invalid_manifest("missing depots"))?;

        let mut dependencies = Vec::new();
        let mut all_depots = Vec::new();
        for raw in raw_depots {
            // Redistributables are declared inline between regular depots.
            if let Some(redist) = raw.get("redist").and_then(|v| v.as_str()) {
                dependencies.push(redist.to_string());
                continue;
            }
            let game_ids: Vec<String> = raw
                .get("gameIDs")
                .and_then(|v| v.as_array())
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| match id {
                            serde_json::Value::String(s) => Some(s.clone()),
                            serde_json::Value::Number(n) => Some(n.to_string()),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();

            let owned = game_ids
                .iter()
                .any(|id| (!dlc_only && *id == product_id) || dlcs.contains(id));
            if !owned {
                continue;
            }

            let depot = Depot {
                game_ids,
                languages: raw
                    .get("languages")
                    .and_then(|v| v.as_array())
                    .map(|langs| {
                        langs
                            .iter()
                            .filter_map(|l| l.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default(),
                size: flexible_u64(raw.get("size")),
                manifest: raw
                    .get("manifest")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::invalid_manifest("depot missing manifest"))?
                    .to_string(),
            };
            all_depots.push(depot);
        }

        let depots = all_depots
            .iter()
            .filter(|d| d.matches_language(language))
            .cloned()
            .collect();

        Ok(Self {
            data: meta,
            platform: platform.to_string(),
            product_id,
            install_directory,
            timestamp,
            language: language.to_string(),
            dlcs,
            dependencies,
            depots,
            all_depots,
        })
    }

    /// Rebuild a manifest from its persisted JSON
    pub fn from_json(data: serde_json::Value) -> Result<Self> {
        let platform = data
            .get("installPlatform")
            .and_then(|v| v.as_str())
            .unwrap_or("windows")
            .to_string();
        let language = data
            .get("installLanguage")
            .and_then(|v| v.as_str())
            .unwrap_or("English")
            .to_string();
        let dlcs = data
            .get("installedDlcs")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|d| d.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Self::new(data, &platform, &language, dlcs, false)
    }

    /// Manifest document with sideband keys, ready for the manifest store
    pub fn to_json(&self) -> serde_json::Value {
        let mut data = self.data.clone();
        if let Some(map) = data.as_object_mut() {
            map.insert(
                "installPlatform".to_string(),
                serde_json::Value::String(self.platform.clone()),
            );
            map.insert(
                "installLanguage".to_string(),
                serde_json::Value::String(self.language.clone()),
            );
            map.insert(
                "installedDlcs".to_string(),
                serde_json::Value::Array(
                    self.dlcs
                        .iter()
                        .map(|d| serde_json::Value::String(d.clone()))
                        .collect(),
                ),
            );
        }
        data
    }

    /// DLC products the build offers
    pub fn listed_products(&self) -> Vec<String> {
        self.data
            .get("product")
            .and_then(|p| p.get("gameIDs"))
            .and_then(|v| v.as_array())
            .map(|products| {
                products
                    .iter()
                    .filter_map(|p| crate::v2::id_field(p, "gameID").ok())
                    .filter(|id| *id != self.product_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fetch every included depot manifest and flatten the file lists
    pub async fn get_files(&self, api: &ApiClient) -> Result<FileList> {
        let mut list = FileList::default();
        for depot in &self.depots {
            let product_id = depot
                .game_ids
                .first()
                .cloned()
                .unwrap_or_else(|| self.product_id.clone());
            let url = v1_manifest_url(&product_id, &self.platform, self.timestamp, &depot.manifest);
            let doc: DepotManifestDoc = api.get_zlib_json(&url).await?;
            debug!(
                "depot {} listed {} records",
                depot.manifest,
                doc.depot.files.len()
            );
            for record in doc.depot.files {
                let Some(raw_path) = record.get("path").and_then(|v| v.as_str()) else {
                    continue;
                };
                if record.get("directory").is_some() {
                    list.dirs.push(normalize_path(raw_path));
                    continue;
                }
                list.files.push(crate::FileEntry::V1(File {
                    product_id: product_id.clone(),
                    path: normalize_path(raw_path),
                    offset: flexible_u64(record.get("offset")),
                    size: flexible_u64(record.get("size")),
                    hash: record
                        .get("hash")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    support: record.get("support").and_then(serde_json::Value::as_bool)
                        == Some(true),
                    executable: record
                        .get("executable")
                        .and_then(serde_json::Value::as_bool)
                        == Some(true),
                }));
            }
        }
        Ok(list)
    }

    /// Per-(product, language) size accounting (Gen-1 has no compression, so
    /// download and disk sizes coincide)
    pub fn calculate_sizes(&self) -> HashMap<String, HashMap<String, SizeInfo>> {
        let mut data: HashMap<String, HashMap<String, SizeInfo>> = HashMap::new();
        for depot in &self.all_depots {
            for product_id in &depot.game_ids {
                let product = data.entry(product_id.clone()).or_default();
                for lang in &depot.languages {
                    let sizes = product.entry(lang.clone()).or_default();
                    sizes.download_size += depot.size;
                    sizes.disk_size += depot.size;
                }
            }
        }
        data
    }

    /// Concrete languages the build offers
    pub fn list_languages(&self) -> Vec<String> {
        languages::list_languages(self.all_depots.iter().map(|d| &d.languages))
    }
}

/// Gen-1 documents encode numbers inconsistently as strings or integers
fn flexible_u64(value: Option<&serde_json::Value>) -> u64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}
