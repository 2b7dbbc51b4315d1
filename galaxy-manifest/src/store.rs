//! Manifest store
//!
//! The manifest of the last successfully installed build is persisted under
//! `<config>/manifests/<product-id>` so the next run can diff against it.

use crate::{Manifest, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk store of previously installed manifests
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    /// Create a store rooted at `<config_dir>/manifests`
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: config_dir.as_ref().join("manifests"),
        }
    }

    /// Path of the persisted manifest for a product
    pub fn path_for(&self, product_id: &str) -> PathBuf {
        self.dir.join(product_id)
    }

    /// Load the previously installed manifest.
    ///
    /// A missing or corrupt file is treated as "no previous install".
    pub async fn load(&self, product_id: &str) -> Result<Option<Manifest>> {
        let path = self.path_for(product_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<serde_json::Value>(&data) {
            Ok(value) => match Manifest::from_json(value) {
                Ok(manifest) => {
                    debug!("loaded previous manifest for {}", product_id);
                    Ok(Some(manifest))
                }
                Err(e) => {
                    warn!("ignoring unreadable manifest for {}: {}", product_id, e);
                    Ok(None)
                }
            },
            Err(e) => {
                warn!("ignoring corrupt manifest for {}: {}", product_id, e);
                Ok(None)
            }
        }
    }

    /// Persist a manifest after a successful run
    pub async fn save(&self, manifest: &Manifest) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(manifest.product_id());
        let data = serde_json::to_vec(&manifest.to_json())?;
        tokio::fs::write(&path, data).await?;
        debug!("persisted manifest for {}", manifest.product_id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v2_manifest() -> Manifest {
        let meta = json!({
            "baseProductId": "1000",
            "installDirectory": "Game",
            "depots": [{
                "productId": "1000",
                "languages": ["*"],
                "manifest": "aabbccdd00112233445566778899aabb",
                "size": 10,
                "compressedSize": 4
            }]
        });
        Manifest::from_v2(crate::v2::Manifest::new(meta, "en-US", Vec::new(), false).unwrap())
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());

        store.save(&v2_manifest()).await.unwrap();
        let loaded = store.load("1000").await.unwrap().unwrap();
        assert_eq!(loaded.product_id(), "1000");
        assert_eq!(loaded.generation(), 2);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        assert!(store.load("1000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        tokio::fs::create_dir_all(dir.path().join("manifests"))
            .await
            .unwrap();
        tokio::fs::write(store.path_for("1000"), b"{not json")
            .await
            .unwrap();
        assert!(store.load("1000").await.unwrap().is_none());
    }
}
