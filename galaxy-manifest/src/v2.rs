//! Gen-2 product and depot manifests
//!
//! Gen-2 builds reference per-product depots whose manifests are zlib-deflated
//! JSON blobs addressed by MD5. Files are split into individually compressed
//! chunks addressed by their compressed MD5.

use crate::{Error, FileList, Result, de_id, languages, normalize_path};
use galaxy_cdn::ApiClient;
use galaxy_cdn::api::v2_meta_url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// One chunk of a depot file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// MD5 of the zlib-compressed bytes; doubles as the CDN address
    pub compressed_md5: String,
    /// MD5 of the uncompressed bytes
    pub md5: String,
    /// Uncompressed size
    pub size: u64,
    /// Compressed size
    pub compressed_size: u64,
}

/// A file inside a depot manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepotFile {
    pub path: String,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(skip)]
    pub product_id: String,
}

impl DepotFile {
    /// Whether the file belongs in the support tree instead of the game root
    pub fn is_support(&self) -> bool {
        self.flags.iter().any(|f| f == "support")
    }

    /// Whether the execute bits should be set after assembly (non-Windows)
    pub fn is_executable(&self) -> bool {
        self.flags.iter().any(|f| f == "executable")
    }

    /// Uncompressed size of the assembled file
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    /// Bytes on the wire when every chunk is fetched
    pub fn download_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.compressed_size).sum()
    }

    /// Checksum recorded in the resume journal: the file-level MD5 when the
    /// manifest carries one, the single chunk's MD5 otherwise
    pub fn final_checksum(&self) -> Option<&str> {
        self.md5
            .as_deref()
            .or_else(|| self.chunks.first().map(|c| c.md5.as_str()))
    }
}

/// A directory creation request inside a depot manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepotDirectory {
    pub path: String,
}

/// A symbolic link inside a depot manifest (Unix targets only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepotLink {
    pub path: String,
    pub target: String,
}

/// Discriminated depot manifest item
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum DepotItem {
    DepotFile(DepotFile),
    DepotDirectory(DepotDirectory),
    DepotLink(DepotLink),
}

/// A depot referenced by the product manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Depot {
    #[serde(deserialize_with = "de_id")]
    pub product_id: String,
    pub languages: Vec<String>,
    #[serde(default)]
    pub os_bitness: Option<Vec<String>>,
    /// MD5 address of the depot manifest blob
    pub manifest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub compressed_size: u64,
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
    items: Vec<DepotItem>,
}

/// Download/disk byte counts for one (product, language) pair
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SizeInfo {
    pub download_size: u64,
    pub disk_size: u64,
}

/// A parsed Gen-2 product manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Raw manifest document, persisted verbatim after a successful run
    data: serde_json::Value,
    pub product_id: String,
    pub install_directory: String,
    pub language: String,
    /// DLC product ids selected for install
    pub dlcs: Vec<String>,
    pub dependencies: Vec<String>,
    /// Depots included for this (language, DLC) selection, declaration order
    pub depots: Vec<Depot>,
    /// Every depot owned by the base product or a selected DLC
    pub all_depots: Vec<Depot>,
}

impl Manifest {
    /// Parse a product manifest for a given language and DLC selection
    pub fn new(
        meta: serde_json::Value,
        language: &str,
        dlcs: Vec<String>,
        dlc_only: bool,
    ) -> Result<Self> {
        let product_id = id_field(&meta, "baseProductId")?;
        let install_directory = meta
            .get("installDirectory")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid_manifest("missing installDirectory"))?
            .to_string();

        let dependencies = meta
            .get("dependencies")
            .and_then(|v| v.as_array())
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| d.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let raw_depots = meta
            .get("depots")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::invalid_manifest("missing depots"))?;

        let mut all_depots = Vec::new();
        for raw in raw_depots {
            let depot: Depot = serde_json::from_value(raw.clone())?;
            let owned = depot.product_id == product_id && !dlc_only;
            if owned || dlcs.contains(&depot.product_id) {
                all_depots.push(depot);
            }
        }
        let depots = all_depots
            .iter()
            .filter(|d| d.matches_language(language))
            .cloned()
            .collect();

        Ok(Self {
            data: meta,
            product_id,
            install_directory,
            language: language.to_string(),
            dlcs,
            dependencies,
            depots,
            all_depots,
        })
    }

    /// Rebuild a manifest from its persisted JSON (sideband keys carry the
    /// install language and DLC selection)
    pub fn from_json(data: serde_json::Value) -> Result<Self> {
        let language = data
            .get("installLanguage")
            .and_then(|v| v.as_str())
            .unwrap_or("en-US")
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
        Self::new(data, &language, dlcs, false)
    }

    /// Manifest document with sideband keys, ready for the manifest store
    pub fn to_json(&self) -> serde_json::Value {
        let mut data = self.data.clone();
        if let Some(map) = data.as_object_mut() {
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

    /// Build id recorded in the manifest, when present
    pub fn build_id(&self) -> Option<String> {
        id_field(&self.data, "buildId").ok()
    }

    /// DLC products the build offers (candidates for `--with-dlcs`)
    pub fn listed_products(&self) -> Vec<String> {
        self.data
            .get("products")
            .and_then(|v| v.as_array())
            .map(|products| {
                products
                    .iter()
                    .filter_map(|p| id_field(p, "productId").ok())
                    .filter(|id| *id != self.product_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fetch every included depot manifest and flatten the item lists.
    ///
    /// Order is deterministic: manifest order within a depot, depots in
    /// declaration order.
    pub async fn get_files(&self, api: &ApiClient) -> Result<FileList> {
        let mut list = FileList::default();
        for depot in &self.depots {
            let doc: DepotManifestDoc = api.get_zlib_json(&v2_meta_url(&depot.manifest)).await?;
            debug!(
                "depot {} listed {} items",
                depot.manifest,
                doc.depot.items.len()
            );
            for item in doc.depot.items {
                match item {
                    DepotItem::DepotFile(mut file) => {
                        file.path = normalize_path(&file.path);
                        file.product_id = depot.product_id.clone();
                        list.files.push(crate::FileEntry::V2(file));
                    }
                    DepotItem::DepotDirectory(dir) => {
                        list.dirs.push(normalize_path(&dir.path));
                    }
                    DepotItem::DepotLink(mut link) => {
                        link.path = normalize_path(&link.path);
                        list.links.push(link);
                    }
                }
            }
        }
        Ok(list)
    }

    /// Per-(product, language) size accounting across all owned depots
    pub fn calculate_sizes(&self) -> HashMap<String, HashMap<String, SizeInfo>> {
        let mut data: HashMap<String, HashMap<String, SizeInfo>> = HashMap::new();
        for depot in &self.all_depots {
            let product = data.entry(depot.product_id.clone()).or_default();
            for lang in &depot.languages {
                let sizes = product.entry(lang.clone()).or_default();
                sizes.download_size += depot.compressed_size;
                sizes.disk_size += depot.size;
            }
        }
        data
    }

    /// Concrete languages the build offers
    pub fn list_languages(&self) -> Vec<String> {
        languages::list_languages(self.all_depots.iter().map(|d| &d.languages))
    }
}

/// Read an id field that may be encoded as a string or a number
pub(crate) fn id_field(value: &serde_json::Value, key: &str) -> Result<String> {
    match value.get(key) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::invalid_manifest(format!("missing {key}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample_meta() -> serde_json::Value {
        json!({
            "baseProductId": "1000",
            "installDirectory": "Game",
            "buildId": "b42",
            "dependencies": ["ISI"],
            "products": [
                {"productId": "1000", "name": "Game"},
                {"productId": "2000", "name": "Game DLC"}
            ],
            "depots": [
                {
                    "productId": "1000",
                    "languages": ["*"],
                    "manifest": "aabbccdd00112233445566778899aabb",
                    "size": 1000,
                    "compressedSize": 400
                },
                {
                    "productId": "1000",
                    "languages": ["de"],
                    "manifest": "bbccddee00112233445566778899aabb",
                    "size": 500,
                    "compressedSize": 200
                },
                {
                    "productId": "2000",
                    "languages": ["en-US"],
                    "manifest": "ccddeeff00112233445566778899aabb",
                    "size": 300,
                    "compressedSize": 100
                }
            ]
        })
    }

    #[test]
    fn test_depot_selection_base_only() {
        let manifest = Manifest::new(sample_meta(), "en-US", Vec::new(), false).unwrap();
        // German depot filtered out by language, DLC depot not selected
        assert_eq!(manifest.depots.len(), 1);
        assert_eq!(manifest.all_depots.len(), 2);
        assert_eq!(manifest.product_id, "1000");
    }

    #[test]
    fn test_depot_selection_with_dlc() {
        let manifest =
            Manifest::new(sample_meta(), "en-US", vec!["2000".to_string()], false).unwrap();
        assert_eq!(manifest.depots.len(), 2);
        assert_eq!(manifest.all_depots.len(), 3);
    }

    #[test]
    fn test_dlc_only_excludes_base() {
        let manifest =
            Manifest::new(sample_meta(), "en-US", vec!["2000".to_string()], true).unwrap();
        assert_eq!(manifest.depots.len(), 1);
        assert_eq!(manifest.depots[0].product_id, "2000");
    }

    #[test]
    fn test_sideband_round_trip() {
        let manifest =
            Manifest::new(sample_meta(), "en-US", vec!["2000".to_string()], false).unwrap();
        let restored = Manifest::from_json(manifest.to_json()).unwrap();
        assert_eq!(restored.language, "en-US");
        assert_eq!(restored.dlcs, vec!["2000".to_string()]);
        assert_eq!(restored.build_id(), Some("b42".to_string()));
    }

    #[test]
    fn test_listed_products_excludes_base() {
        let manifest = Manifest::new(sample_meta(), "en-US", Vec::new(), false).unwrap();
        assert_eq!(manifest.listed_products(), vec!["2000".to_string()]);
    }

    #[test]
    fn test_size_accounting() {
        let manifest =
            Manifest::new(sample_meta(), "en-US", vec!["2000".to_string()], false).unwrap();
        let sizes = manifest.calculate_sizes();
        assert_eq!(sizes["1000"]["*"].disk_size, 1000);
        assert_eq!(sizes["1000"]["de"].download_size, 200);
        assert_eq!(sizes["2000"]["en-US"].disk_size, 300);
    }

    #[test]
    fn test_final_checksum_prefers_file_md5() {
        let file: DepotFile = serde_json::from_value(json!({
            "path": "a/b",
            "md5": "ff00",
            "chunks": [{
                "compressedMd5": "cc", "md5": "dd", "size": 10, "compressedSize": 4
            }]
        }))
        .unwrap();
        assert_eq!(file.final_checksum(), Some("ff00"));
    }

    #[test]
    fn test_depot_item_tagging() {
        let item: DepotItem = serde_json::from_value(json!({
            "type": "DepotDirectory",
            "path": "bin"
        }))
        .unwrap();
        assert!(matches!(item, DepotItem::DepotDirectory(_)));
    }
}
