//! Shared redistributable repository
//!
//! Redistributables (runtimes shared across products) live in their own
//! versioned repository. Each depot inside it carries a dependency id and an
//! executable path; a path under `__redist` marks a redistributable that
//! installs into the shared tree rather than the game directory.

use crate::{FileList, Result, normalize_path, v2};
use galaxy_cdn::ApiClient;
use galaxy_cdn::api::{dependencies_meta_url, dependencies_repository_url};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RepositoryPointer {
    repository_manifest: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryDoc {
    #[serde(default)]
    depots: Vec<RawDepot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDepot {
    dependency_id: String,
    executable: Executable,
    manifest: String,
    #[serde(default)]
    readable_name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct Executable {
    #[serde(default)]
    path: String,
}

/// One redistributable offered by the repository
#[derive(Debug, Clone)]
pub struct DependencyDepot {
    pub id: String,
    /// Path of the redistributable's executable; `__redist/...` marks the
    /// shared tree, anything else installs into the game directory
    pub executable_path: String,
    /// MD5 address of the Gen-2 depot manifest blob
    pub manifest: String,
    pub readable_name: String,
    pub size: u64,
}

impl DependencyDepot {
    /// Whether this redistributable installs into the shared `__redist` tree
    pub fn is_global(&self) -> bool {
        self.executable_path.starts_with("__redist")
    }
}

/// The global redistributable repository manifest
#[derive(Debug, Clone)]
pub struct DependencyRepository {
    pub depots: Vec<DependencyDepot>,
}

impl DependencyRepository {
    /// Fetch the repository descriptor and follow its manifest link
    pub async fn fetch(api: &ApiClient) -> Result<Self> {
        let pointer: RepositoryPointer = api
            .http()
            .get_json(&dependencies_repository_url())
            .await?;
        let doc: RepositoryDoc = api.get_zlib_json(&pointer.repository_manifest).await?;
        debug!("dependency repository lists {} depots", doc.depots.len());
        Ok(Self {
            depots: doc
                .depots
                .into_iter()
                .map(|raw| DependencyDepot {
                    id: raw.dependency_id,
                    executable_path: raw.executable.path,
                    manifest: raw.manifest,
                    readable_name: raw.readable_name,
                    size: raw.size,
                })
                .collect(),
        })
    }

    /// Select the depots whose id is wanted.
    ///
    /// `global` picks redistributables for the shared `__redist` tree; the
    /// complement installs into the game directory.
    pub fn select(&self, ids: &[String], global: bool) -> Vec<&DependencyDepot> {
        self.depots
            .iter()
            .filter(|depot| ids.contains(&depot.id) && depot.is_global() == global)
            .collect()
    }

    /// Fetch the file list of one redistributable depot (Gen-2 structure)
    pub async fn get_files(depot: &DependencyDepot, api: &ApiClient) -> Result<FileList> {
        #[derive(Deserialize)]
        struct Doc {
            depot: Body,
        }
        #[derive(Deserialize)]
        struct Body {
            items: Vec<v2::DepotItem>,
        }

        let doc: Doc = api
            .get_zlib_json(&dependencies_meta_url(&depot.manifest))
            .await?;
        let mut list = FileList::default();
        for item in doc.depot.items {
            match item {
                v2::DepotItem::DepotFile(mut file) => {
                    file.path = normalize_path(&file.path);
                    file.product_id = "redist".to_string();
                    list.files.push(crate::FileEntry::V2(file));
                }
                v2::DepotItem::DepotDirectory(dir) => list.dirs.push(normalize_path(&dir.path)),
                v2::DepotItem::DepotLink(mut link) => {
                    link.path = normalize_path(&link.path);
                    list.links.push(link);
                }
            }
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository() -> DependencyRepository {
        DependencyRepository {
            depots: vec![
                DependencyDepot {
                    id: "ISI".into(),
                    executable_path: "__redist/ISI/scriptinterpreter.exe".into(),
                    manifest: "aa".into(),
                    readable_name: "Script Interpreter".into(),
                    size: 100,
                },
                DependencyDepot {
                    id: "MSVC2019".into(),
                    executable_path: "redist/vcredist.exe".into(),
                    manifest: "bb".into(),
                    readable_name: "MSVC runtime".into(),
                    size: 200,
                },
            ],
        }
    }

    #[test]
    fn test_select_global() {
        let repo = repository();
        let ids = vec!["ISI".to_string(), "MSVC2019".to_string()];
        let global = repo.select(&ids, true);
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].id, "ISI");
    }

    #[test]
    fn test_select_in_game() {
        let repo = repository();
        let ids = vec!["ISI".to_string(), "MSVC2019".to_string()];
        let local = repo.select(&ids, false);
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].id, "MSVC2019");
    }

    #[test]
    fn test_select_unlisted_id() {
        let repo = repository();
        let ids = vec!["DOSBOX".to_string()];
        assert!(repo.select(&ids, true).is_empty());
        assert!(repo.select(&ids, false).is_empty());
    }
}
