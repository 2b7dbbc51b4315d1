//! Manifest model for the GOG Galaxy content system
//!
//! Parses Gen-1 and Gen-2 product manifests, depot manifests, patch
//! manifests and the shared dependency repository into a unified file model
//! the diff engine consumes. Also persists the last installed manifest for
//! later diffing.

pub mod dependencies;
pub mod error;
pub mod languages;
pub mod linux;
pub mod patches;
pub mod store;
pub mod v1;
pub mod v2;

pub use dependencies::{DependencyDepot, DependencyRepository};
pub use error::{Error, Result};
pub use linux::LinuxFile;
pub use patches::{PatchItem, fetch_patches};
pub use store::ManifestStore;
pub use v2::{Chunk, DepotFile, DepotLink};

use galaxy_cdn::ApiClient;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

/// A file from any content-system generation, as seen by the diff engine
#[derive(Debug, Clone)]
pub enum FileEntry {
    /// Gen-1: a byte range of a depot's `main.bin`
    V1(v1::File),
    /// Gen-2: an ordered list of content-addressed chunks
    V2(v2::DepotFile),
    /// A byte range of a Linux native installer archive
    Linux(LinuxFile),
}

impl FileEntry {
    /// Install-relative path (not yet re-rooted for support files)
    pub fn path(&self) -> &str {
        match self {
            Self::V1(f) => &f.path,
            Self::V2(f) => &f.path,
            Self::Linux(f) => &f.path,
        }
    }

    /// Uncompressed size of the materialised file
    pub fn size(&self) -> u64 {
        match self {
            Self::V1(f) => f.size,
            Self::V2(f) => f.size(),
            Self::Linux(f) => f.size,
        }
    }

    /// Bytes fetched over the wire when nothing can be reused
    pub fn download_size(&self) -> u64 {
        match self {
            Self::V1(f) => f.size,
            Self::V2(f) => f.download_size(),
            Self::Linux(f) => f.compressed_size,
        }
    }

    /// Product the file belongs to (routes secure links)
    pub fn product_id(&self) -> &str {
        match self {
            Self::V1(f) => &f.product_id,
            Self::V2(f) => &f.product_id,
            Self::Linux(f) => &f.product_id,
        }
    }

    /// Whether the file is routed to the support tree
    pub fn is_support(&self) -> bool {
        match self {
            Self::V1(f) => f.support,
            Self::V2(f) => f.is_support(),
            Self::Linux(_) => false,
        }
    }

    /// Whether execute bits are set after assembly
    pub fn is_executable(&self) -> bool {
        match self {
            Self::V1(f) => f.executable,
            Self::V2(f) => f.is_executable(),
            Self::Linux(f) => f.executable,
        }
    }

    /// Checksum recorded in the resume journal once the file is complete
    pub fn final_checksum(&self) -> Option<String> {
        match self {
            Self::V1(f) => Some(f.hash.clone()),
            Self::V2(f) => f.final_checksum().map(String::from),
            Self::Linux(f) => Some(f.checksum()),
        }
    }
}

/// The flattened content of a manifest: files, directories and symlinks
#[derive(Debug, Clone, Default)]
pub struct FileList {
    pub files: Vec<FileEntry>,
    pub dirs: Vec<String>,
    pub links: Vec<DepotLink>,
}

impl FileList {
    /// Merge another list into this one, preserving order
    pub fn extend(&mut self, other: FileList) {
        self.files.extend(other.files);
        self.dirs.extend(other.dirs);
        self.links.extend(other.links);
    }
}

/// A product manifest of either content-system generation
#[derive(Debug, Clone)]
pub enum Manifest {
    V1(v1::Manifest),
    V2(v2::Manifest),
}

impl Manifest {
    /// Wrap a Gen-1 manifest
    pub fn from_v1(manifest: v1::Manifest) -> Self {
        Self::V1(manifest)
    }

    /// Wrap a Gen-2 manifest
    pub fn from_v2(manifest: v2::Manifest) -> Self {
        Self::V2(manifest)
    }

    /// Rebuild from persisted JSON, sniffing the generation (Gen-1 documents
    /// nest everything under a `product` object)
    pub fn from_json(data: serde_json::Value) -> Result<Self> {
        if data.get("product").is_some() {
            Ok(Self::V1(v1::Manifest::from_json(data)?))
        } else {
            Ok(Self::V2(v2::Manifest::from_json(data)?))
        }
    }

    /// Content-system generation
    pub fn generation(&self) -> u32 {
        match self {
            Self::V1(_) => 1,
            Self::V2(_) => 2,
        }
    }

    /// Base product id
    pub fn product_id(&self) -> &str {
        match self {
            Self::V1(m) => &m.product_id,
            Self::V2(m) => &m.product_id,
        }
    }

    /// Directory name appended to the install root
    pub fn install_directory(&self) -> &str {
        match self {
            Self::V1(m) => &m.install_directory,
            Self::V2(m) => &m.install_directory,
        }
    }

    /// External dependency ids (redistributables)
    pub fn dependencies(&self) -> &[String] {
        match self {
            Self::V1(m) => &m.dependencies,
            Self::V2(m) => &m.dependencies,
        }
    }

    /// Installed language tag
    pub fn language(&self) -> &str {
        match self {
            Self::V1(m) => &m.language,
            Self::V2(m) => &m.language,
        }
    }

    /// DLC ids selected for install
    pub fn dlcs(&self) -> &[String] {
        match self {
            Self::V1(m) => &m.dlcs,
            Self::V2(m) => &m.dlcs,
        }
    }

    /// DLC products the build offers
    pub fn listed_products(&self) -> Vec<String> {
        match self {
            Self::V1(m) => m.listed_products(),
            Self::V2(m) => m.listed_products(),
        }
    }

    /// Fetch depot manifests and flatten the file lists
    pub async fn get_files(&self, api: &ApiClient) -> Result<FileList> {
        match self {
            Self::V1(m) => m.get_files(api).await,
            Self::V2(m) => m.get_files(api).await,
        }
    }

    /// Per-(product, language) size accounting
    pub fn calculate_sizes(&self) -> HashMap<String, HashMap<String, v2::SizeInfo>> {
        match self {
            Self::V1(m) => m.calculate_sizes(),
            Self::V2(m) => m.calculate_sizes(),
        }
    }

    /// Concrete languages the build offers
    pub fn list_languages(&self) -> Vec<String> {
        match self {
            Self::V1(m) => m.list_languages(),
            Self::V2(m) => m.list_languages(),
        }
    }

    /// Manifest document with sideband keys, ready for the manifest store
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::V1(m) => m.to_json(),
            Self::V2(m) => m.to_json(),
        }
    }
}

/// Normalise a manifest path: foreign separators become the host separator
/// and leading separators are stripped
pub fn normalize_path(raw: &str) -> String {
    let unified = raw.replace('\\', "/");
    let trimmed = unified.trim_start_matches('/');
    if std::path::MAIN_SEPARATOR == '/' {
        trimmed.to_string()
    } else {
        trimmed.replace('/', std::path::MAIN_SEPARATOR_STR)
    }
}

/// Deserialize an id that may be encoded as a string or a number
pub(crate) fn de_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_strips_and_converts() {
        assert_eq!(normalize_path("/bin/game.exe"), "bin/game.exe");
        assert_eq!(normalize_path("bin\\game.exe"), "bin/game.exe");
        assert_eq!(normalize_path("\\bin\\sub\\game.exe"), "bin/sub/game.exe");
    }

    #[test]
    fn test_manifest_sniffing() {
        let v1 = serde_json::json!({
            "product": {
                "rootGameID": "1",
                "installDirectory": "G",
                "timestamp": 1,
                "depots": [],
                "gameIDs": []
            }
        });
        assert_eq!(Manifest::from_json(v1).unwrap().generation(), 1);

        let v2 = serde_json::json!({
            "baseProductId": "1",
            "installDirectory": "G",
            "depots": []
        });
        assert_eq!(Manifest::from_json(v2).unwrap().generation(), 2);
    }
}
