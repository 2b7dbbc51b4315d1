//! Engine facade
//!
//! Drives a whole run: build selection, manifest fetch, diffing against the
//! previously installed manifest, dependency resolution, patch discovery,
//! planning, secure-link acquisition and orchestration. The CLI calls one
//! of [`Engine::info`], [`Engine::install`] or [`Engine::install_redist`].

use crate::cache::ChunkCache;
use crate::diff::{ChangedFile, Diff, FileDiff};
use crate::downloader::LinkTable;
use crate::journal::ResumeJournal;
use crate::orchestrator::{LinkRefresher, Orchestrator};
use crate::paths::TargetPaths;
use crate::plan::{Plan, build_plan};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::task::Task;
use crate::zip::InstallerArchive;
use crate::{Error, Result};
use galaxy_cdn::api::Build;
use galaxy_cdn::secure_link::{
    Endpoint, SecureLink, fetch_dependency_link, fetch_secure_link, fetch_secure_link_at,
};
use galaxy_cdn::{ApiClient, CdnClient};
use galaxy_manifest::{
    DependencyRepository, FileEntry, FileList, Manifest, ManifestStore, fetch_patches, v1, v2,
};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which DLCs to include
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DlcSelection {
    /// Base game only
    #[default]
    None,
    /// Every DLC the build lists
    All,
    /// An explicit id list
    Ids(Vec<String>),
}

/// Parameters of one install/update/repair run
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub product_id: String,
    /// Target platform: `windows`, `osx` or `linux`
    pub platform: String,
    pub language: String,
    pub build_id: Option<String>,
    pub branch: Option<String>,
    pub branch_password: Option<String>,
    pub dlcs: DlcSelection,
    pub dlc_only: bool,
    /// Base path; the manifest's install directory is appended
    pub install_path: PathBuf,
    pub support_path: Option<PathBuf>,
    pub workers: usize,
    pub arena_size: u64,
    pub force_generation: Option<u32>,
    /// Verify on-disk content and refetch only mismatching chunks
    pub repair: bool,
    /// Downlink of the Linux native installer, for products without Linux
    /// depots (resolved by the caller's authenticated API layer)
    pub linux_installer_url: Option<String>,
}

impl InstallOptions {
    pub fn new(product_id: impl Into<String>, install_path: impl Into<PathBuf>) -> Self {
        Self {
            product_id: product_id.into(),
            platform: "windows".to_string(),
            language: "en-US".to_string(),
            build_id: None,
            branch: None,
            branch_password: None,
            dlcs: DlcSelection::None,
            dlc_only: false,
            install_path: install_path.into(),
            support_path: None,
            workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
            arena_size: crate::arena::DEFAULT_ARENA_SIZE,
            force_generation: None,
            repair: false,
            linux_installer_url: None,
        }
    }
}

/// Summary printed by the `info` subcommand
#[derive(Debug, Serialize)]
pub struct InfoReport {
    pub product_id: String,
    pub build_id: String,
    pub version_name: String,
    pub generation: u32,
    pub folder_name: String,
    pub download_size: u64,
    pub disk_size: u64,
    pub languages: Vec<String>,
    pub dlcs: Vec<String>,
    pub dependencies: Vec<String>,
    pub available_branches: Vec<Option<String>>,
}

/// The download-and-apply engine
pub struct Engine {
    client: CdnClient,
    api: ApiClient,
    store: ManifestStore,
}

impl Engine {
    /// Engine over an HTTP client and the config directory holding the
    /// manifest store
    pub fn new(client: CdnClient, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            api: ApiClient::new(client.clone()),
            client,
            store: ManifestStore::new(config_dir.into()),
        }
    }

    /// Pick the target build for the request
    async fn select_build(&self, opts: &InstallOptions) -> Result<(Build, Vec<Option<String>>)> {
        let generation = opts.force_generation.unwrap_or(2);
        if let Some(generation) = opts.force_generation {
            if generation != 1 && generation != 2 {
                return Err(Error::structural(format!(
                    "unsupported generation {generation}"
                )));
            }
        }
        let page = self
            .api
            .get_builds(
                &opts.product_id,
                &opts.platform,
                generation,
                opts.branch_password.as_deref(),
            )
            .await?;
        let branches = page.branches();

        let candidates: Vec<&Build> = page
            .items
            .iter()
            .filter(|b| b.branch == opts.branch)
            .collect();
        let build = match &opts.build_id {
            Some(id) => candidates
                .iter()
                .find(|b| b.build_id == *id || b.legacy_build_id().as_deref() == Some(id))
                .copied(),
            None => candidates.first().copied(),
        }
        .or_else(|| page.items.first())
        .ok_or_else(|| Error::structural("no matching build"))?;

        if build.generation != 1 && build.generation != 2 {
            return Err(Error::structural(format!(
                "unsupported generation {}",
                build.generation
            )));
        }
        Ok((build.clone(), branches))
    }

    /// Fetch and parse the product manifest of a build
    async fn fetch_manifest(&self, build: &Build, opts: &InstallOptions) -> Result<Manifest> {
        let meta: serde_json::Value = self.api.get_zlib_json(&build.link).await?;
        let dlc_ids = resolve_dlcs(&meta, build.generation, &opts.product_id, &opts.dlcs);
        let manifest = match build.generation {
            1 => Manifest::from_v1(v1::Manifest::new(
                meta,
                &opts.platform,
                &opts.language,
                dlc_ids,
                opts.dlc_only,
            )?),
            _ => Manifest::from_v2(v2::Manifest::new(
                meta,
                &opts.language,
                dlc_ids,
                opts.dlc_only,
            )?),
        };
        Ok(manifest)
    }

    /// `info` subcommand: sizes, languages, DLCs and branches, no writes
    pub async fn info(&self, opts: &InstallOptions) -> Result<InfoReport> {
        let (build, branches) = self.select_build(opts).await?;
        let manifest = self.fetch_manifest(&build, opts).await?;

        let (download_size, disk_size) = match &manifest {
            Manifest::V1(m) => {
                let size: u64 = m.depots.iter().map(|d| d.size).sum();
                (size, size)
            }
            Manifest::V2(m) => (
                m.depots.iter().map(|d| d.compressed_size).sum(),
                m.depots.iter().map(|d| d.size).sum(),
            ),
        };

        Ok(InfoReport {
            product_id: opts.product_id.clone(),
            build_id: build.build_id.clone(),
            version_name: build.version_name.clone(),
            generation: build.generation,
            folder_name: manifest.install_directory().to_string(),
            download_size,
            disk_size,
            languages: manifest.list_languages(),
            dlcs: manifest.listed_products(),
            dependencies: manifest.dependencies().to_vec(),
            available_branches: branches,
        })
    }

    /// `download`/`update`/`repair`: materialise the target build
    pub async fn install(&self, opts: &InstallOptions, cancel: CancellationToken) -> Result<()> {
        if opts.platform == "linux" {
            // Linux products without depots ship native installers.
            match self.select_build(opts).await {
                Ok(_) => {}
                Err(_) if opts.linux_installer_url.is_some() => {
                    return self.install_linux_native(opts, cancel).await;
                }
                Err(e) => return Err(e),
            }
        }

        let (build, _branches) = self.select_build(opts).await?;
        info!(
            "installing {} build {} (generation {})",
            opts.product_id, build.build_id, build.generation
        );

        let (manifest, old_manifest) = if opts.repair {
            let installed = self.store.load(&opts.product_id).await?.ok_or_else(|| {
                Error::structural(format!(
                    "no installed manifest for {}, cannot repair",
                    opts.product_id
                ))
            })?;
            (installed, None)
        } else {
            let manifest = self.fetch_manifest(&build, opts).await?;
            let old_manifest = self.store.load(&opts.product_id).await?;
            (manifest, old_manifest)
        };

        let install_root = opts.install_path.join(manifest.install_directory());
        let support_root = opts
            .support_path
            .clone()
            .unwrap_or_else(|| install_root.join("gog-support"));
        let paths = TargetPaths::new(&install_root, &support_root);

        let mut files = manifest.get_files(&self.api).await?;
        let old_files = match &old_manifest {
            Some(old) => Some(old.get_files(&self.api).await?),
            None => None,
        };

        // Dependencies installed into the game directory.
        let repository = if manifest.dependencies().is_empty()
            && old_manifest
                .as_ref()
                .is_none_or(|m| m.dependencies().is_empty())
        {
            None
        } else {
            Some(DependencyRepository::fetch(&self.api).await?)
        };
        let mut redist_files = FileList::default();
        let mut removed_redist = Vec::new();
        if let Some(repository) = &repository {
            for depot in repository.select(manifest.dependencies(), false) {
                redist_files.extend(DependencyRepository::get_files(depot, &self.api).await?);
            }
            if let Some(old) = &old_manifest {
                let removed: Vec<String> = old
                    .dependencies()
                    .iter()
                    .filter(|id| !manifest.dependencies().contains(id))
                    .cloned()
                    .collect();
                for depot in repository.select(&removed, false) {
                    removed_redist
                        .extend(DependencyRepository::get_files(depot, &self.api).await?.files);
                }
            }
        }

        // Delta patches only apply between two known Gen-2 builds.
        let patches = match (&old_manifest, build.generation) {
            (Some(Manifest::V2(old)), 2) if !opts.repair => {
                let from = old.build_id();
                match from {
                    Some(from) if from != build.build_id => {
                        fetch_patches(
                            &self.api,
                            &opts.product_id,
                            &from,
                            &build.build_id,
                            &opts.language,
                            manifest.dlcs(),
                        )
                        .await?
                    }
                    _ => None,
                }
            }
            _ => None,
        };

        let mut diff = if opts.repair {
            let verify_files = files.clone();
            let verify_paths = paths.clone();
            tokio::task::spawn_blocking(move || verify_local(&verify_files, &verify_paths))
                .await
                .map_err(|e| Error::structural(format!("verification task failed: {e}")))?
        } else {
            Diff::compare(&files, old_files.as_ref(), patches.as_deref())
        };
        diff.redist = std::mem::take(&mut redist_files.files);
        diff.removed_redist = removed_redist;
        files.dirs.extend(std::mem::take(&mut redist_files.dirs));
        diff.links.extend(std::mem::take(&mut redist_files.links));

        // Plan against journal and crash-surviving cache state. A repair
        // trusts only the on-disk verification pass, never the journal.
        let journal = ResumeJournal::new(&install_root);
        let journal_entries = if opts.repair { Vec::new() } else { journal.load()? };
        let cache = ChunkCache::new(&install_root);
        let cached = cache.existing_entries()?;
        let plan = build_plan(&diff, &journal_entries, &cached, &paths);
        plan.check_free_space(&paths)?;

        // Directories requested by the manifests.
        std::fs::create_dir_all(&install_root)?;
        for dir in &files.dirs {
            std::fs::create_dir_all(paths.resolve_install(dir))?;
        }

        let generation = manifest.generation();
        let links = self
            .acquire_links(&plan, generation, opts.linux_installer_url.as_deref())
            .await?;
        let (progress, progress_rx) =
            ProgressTracker::new(plan.download_size, plan.disk_size, plan.files_total);
        forward_progress(progress_rx);

        let orchestrator = Orchestrator {
            client: self.client.clone(),
            links,
            refresher: LinkRefresher::new(self.client.clone(), generation),
            paths: paths.clone(),
            workers: opts.workers,
            arena_size: opts.arena_size,
            cancel,
        };
        orchestrator.execute(plan, Arc::clone(&progress)).await?;

        // Clean completion: persist the manifest, drop journal and cache.
        self.store.save(&manifest).await?;
        journal.delete()?;
        cache.remove_all()?;
        info!("{} is up to date", opts.product_id);
        Ok(())
    }

    /// Install a product from its Linux native installer archive
    async fn install_linux_native(
        &self,
        opts: &InstallOptions,
        cancel: CancellationToken,
    ) -> Result<()> {
        let url = opts
            .linux_installer_url
            .as_deref()
            .ok_or_else(|| Error::structural("no Linux installer downlink provided"))?;
        let archive = InstallerArchive::open(&self.client, &opts.product_id, url).await?;

        let files = FileList {
            files: archive.files.iter().cloned().map(FileEntry::Linux).collect(),
            dirs: Vec::new(),
            links: archive.links.clone(),
        };

        let install_root = opts.install_path.clone();
        let support_root = install_root.join("gog-support");
        let paths = TargetPaths::new(&install_root, &support_root);

        let diff = Diff::compare(&files, None, None);
        let journal = ResumeJournal::new(&install_root);
        let journal_entries = journal.load()?;
        let cache = ChunkCache::new(&install_root);
        let plan = build_plan(&diff, &journal_entries, &cache.existing_entries()?, &paths);
        plan.check_free_space(&paths)?;
        std::fs::create_dir_all(&install_root)?;

        let links = LinkTable::new();
        links.insert(
            format!("linux:{}", opts.product_id),
            installer_link(&opts.product_id, &archive.url),
        );

        let (progress, progress_rx) =
            ProgressTracker::new(plan.download_size, plan.disk_size, plan.files_total);
        forward_progress(progress_rx);
        let orchestrator = Orchestrator {
            client: self.client.clone(),
            links,
            refresher: LinkRefresher::new(self.client.clone(), 2),
            paths,
            workers: opts.workers,
            arena_size: opts.arena_size,
            cancel,
        };
        orchestrator.execute(plan, Arc::clone(&progress)).await?;

        journal.delete()?;
        cache.remove_all()?;
        Ok(())
    }

    /// Install shared redistributables (the `redist` subcommand)
    pub async fn install_redist(
        &self,
        ids: &[String],
        path: &std::path::Path,
        workers: usize,
        cancel: CancellationToken,
    ) -> Result<()> {
        let repository = DependencyRepository::fetch(&self.api).await?;
        let mut files = FileList::default();
        for depot in repository.select(ids, true) {
            debug!("including redistributable {}", depot.id);
            files.extend(DependencyRepository::get_files(depot, &self.api).await?);
        }
        if files.files.is_empty() {
            warn!("no redistributables matched {:?}", ids);
            return Ok(());
        }

        let paths = TargetPaths::new(path, path.join("gog-support"));
        let mut diff = Diff {
            links: files.links.clone(),
            ..Diff::default()
        };
        diff.redist = files.files;

        let journal = ResumeJournal::new(path);
        let cache = ChunkCache::new(path);
        let plan = build_plan(&diff, &journal.load()?, &cache.existing_entries()?, &paths);
        plan.check_free_space(&paths)?;
        std::fs::create_dir_all(path)?;

        let links = LinkTable::new();
        links.insert("redist", fetch_dependency_link(&self.client).await?);

        let (progress, _rx) =
            ProgressTracker::new(plan.download_size, plan.disk_size, plan.files_total);
        let orchestrator = Orchestrator {
            client: self.client.clone(),
            links,
            refresher: LinkRefresher::new(self.client.clone(), 2),
            paths,
            workers,
            arena_size: crate::arena::DEFAULT_ARENA_SIZE,
            cancel,
        };
        orchestrator.execute(plan, progress).await?;
        journal.delete()?;
        cache.remove_all()?;
        Ok(())
    }

    /// Acquire every secure link the plan's tasks reference
    async fn acquire_links(
        &self,
        plan: &Plan,
        generation: u32,
        installer_url: Option<&str>,
    ) -> Result<LinkTable> {
        let mut keys = HashSet::new();
        for task in &plan.tasks {
            match task {
                Task::Chunk(c) => {
                    keys.insert(c.link_key.clone());
                }
                Task::V1(v) => {
                    keys.insert(v.link_key.clone());
                }
                Task::File(_) => {}
            }
        }

        let links = LinkTable::new();
        for key in keys {
            let link = if key == "redist" {
                fetch_dependency_link(&self.client).await?
            } else if let Some(product) = key.strip_suffix(":patch") {
                fetch_secure_link_at(&self.client, product, 2, "/patches/store").await?
            } else if let Some(product) = key.strip_prefix("linux:") {
                let url = installer_url.ok_or_else(|| {
                    Error::structural("plan references an installer but no downlink was given")
                })?;
                installer_link(product, url)
            } else {
                fetch_secure_link(&self.client, &key, generation).await?
            };
            links.insert(key, link);
        }
        Ok(links)
    }
}

/// Forward progress snapshots as structured log events (one JSON line per
/// update on the `progress` target); front ends subscribe via their log
/// layer
fn forward_progress(mut rx: watch::Receiver<ProgressSnapshot>) {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let snapshot = *rx.borrow();
            if let Ok(line) = serde_json::to_string(&snapshot) {
                info!(target: "progress", "{line}");
            }
        }
    });
}

/// Wrap a plain installer downlink as a secure-link table row
fn installer_link(product_id: &str, url: &str) -> SecureLink {
    SecureLink::new(
        product_id,
        Endpoint {
            endpoint_name: "installer".to_string(),
            url_format: String::new(),
            url: url.to_string(),
            parameters: std::collections::HashMap::new(),
            supports_generation: vec![1],
            priority: 0,
        },
    )
}

/// Resolve the DLC selection against the ids a build actually offers
fn resolve_dlcs(
    meta: &serde_json::Value,
    generation: u32,
    product_id: &str,
    selection: &DlcSelection,
) -> Vec<String> {
    let offered: Vec<String> = match generation {
        1 => meta
            .get("product")
            .and_then(|p| p.get("gameIDs"))
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| id_of(i, "gameID"))
                    .filter(|id| id != product_id)
                    .collect()
            })
            .unwrap_or_default(),
        _ => meta
            .get("products")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| id_of(i, "productId"))
                    .filter(|id| id != product_id)
                    .collect()
            })
            .unwrap_or_default(),
    };

    match selection {
        DlcSelection::None => Vec::new(),
        DlcSelection::All => offered,
        DlcSelection::Ids(wanted) => offered
            .into_iter()
            .filter(|id| wanted.contains(id))
            .collect(),
    }
}

fn id_of(value: &serde_json::Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Repair pass: hash on-disk files against the manifest and classify every
/// mismatch so only the diverging chunks are refetched
fn verify_local(files: &FileList, paths: &TargetPaths) -> Diff {
    use std::io::Read;

    let mut diff = Diff {
        links: files.links.clone(),
        ..Diff::default()
    };

    for entry in &files.files {
        let flags = if entry.is_support() {
            crate::task::TaskFlags::SUPPORT
        } else {
            crate::task::TaskFlags::empty()
        };
        let path = paths.resolve(entry.path(), flags, entry.product_id());
        if !path.is_file() {
            diff.new.push(entry.clone());
            continue;
        }

        match entry {
            FileEntry::V2(file) => {
                let mut old_offsets: Vec<Option<u64>> = Vec::with_capacity(file.chunks.len());
                let mut clean = true;
                let mut offset = 0u64;
                let handle = std::fs::File::open(&path);
                let Ok(mut handle) = handle else {
                    diff.new.push(entry.clone());
                    continue;
                };
                for chunk in &file.chunks {
                    let mut buffer = vec![0u8; chunk.size as usize];
                    let matches = handle
                        .read_exact(&mut buffer)
                        .is_ok_and(|()| hex::encode(md5::compute(&buffer).0) == chunk.md5);
                    if matches {
                        old_offsets.push(Some(offset));
                    } else {
                        old_offsets.push(None);
                        clean = false;
                    }
                    offset += chunk.size;
                }
                // Trailing garbage also forces a rewrite.
                let disk_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                if clean && disk_size == file.size() {
                    continue;
                }
                debug!("repairing {}", file.path);
                diff.changed.push(ChangedFile::Partial(FileDiff {
                    file: file.clone(),
                    old_offsets,
                }));
            }
            FileEntry::V1(file) => {
                let matches = hash_md5(&path).is_some_and(|sum| sum == file.hash);
                if !matches {
                    diff.changed.push(ChangedFile::Whole(entry.clone()));
                }
            }
            FileEntry::Linux(file) => {
                let matches = hash_crc32(&path).is_some_and(|sum| sum == file.crc32);
                if !matches {
                    diff.changed.push(ChangedFile::Whole(entry.clone()));
                }
            }
        }
    }
    diff
}

fn hash_md5(path: &std::path::Path) -> Option<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path).ok()?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).ok()?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Some(format!("{:x}", context.finalize()))
}

fn hash_crc32(path: &std::path::Path) -> Option<u32> {
    use std::io::Read;
    let mut file = std::fs::File::open(path).ok()?;
    let mut crc = flate2::Crc::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).ok()?;
        if read == 0 {
            break;
        }
        crc.update(&buffer[..read]);
    }
    Some(crc.sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use galaxy_manifest::v2::{Chunk, DepotFile};

    fn chunk_of(data: &[u8]) -> Chunk {
        Chunk {
            compressed_md5: format!("c-{}", hex::encode(&md5::compute(data).0[..4])),
            md5: hex::encode(md5::compute(data).0),
            size: data.len() as u64,
            compressed_size: data.len() as u64 / 2,
        }
    }

    #[test]
    fn test_resolve_dlcs_filters_unoffered_ids() {
        let meta = serde_json::json!({
            "products": [
                {"productId": "1000"},
                {"productId": "2000"},
                {"productId": "3000"}
            ]
        });
        assert_eq!(
            resolve_dlcs(&meta, 2, "1000", &DlcSelection::All),
            vec!["2000", "3000"]
        );
        assert_eq!(
            resolve_dlcs(
                &meta,
                2,
                "1000",
                &DlcSelection::Ids(vec!["3000".into(), "9999".into()])
            ),
            vec!["3000"]
        );
        assert!(resolve_dlcs(&meta, 2, "1000", &DlcSelection::None).is_empty());
    }

    #[test]
    fn test_verify_local_classifies_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(dir.path().join("game"), dir.path().join("support"));
        std::fs::create_dir_all(dir.path().join("game")).unwrap();

        let good = b"good chunk bytes";
        let bad_first = b"first half ";
        let bad_second = b"second half";

        // Intact file
        std::fs::write(dir.path().join("game/intact.bin"), good).unwrap();
        let intact = DepotFile {
            path: "intact.bin".into(),
            chunks: vec![chunk_of(good)],
            flags: Vec::new(),
            md5: None,
            sha256: None,
            product_id: "1000".into(),
        };

        // Corrupted in its second chunk
        let mut corrupt_bytes = bad_first.to_vec();
        corrupt_bytes.extend_from_slice(b"CORRUPTEDXX");
        std::fs::write(dir.path().join("game/corrupt.bin"), &corrupt_bytes).unwrap();
        let corrupt = DepotFile {
            path: "corrupt.bin".into(),
            chunks: vec![chunk_of(bad_first), chunk_of(bad_second)],
            flags: Vec::new(),
            md5: None,
            sha256: None,
            product_id: "1000".into(),
        };

        let files = FileList {
            files: vec![
                FileEntry::V2(intact),
                FileEntry::V2(corrupt),
                FileEntry::V2(DepotFile {
                    path: "missing.bin".into(),
                    chunks: vec![chunk_of(b"never written")],
                    flags: Vec::new(),
                    md5: None,
                    sha256: None,
                    product_id: "1000".into(),
                }),
            ],
            dirs: Vec::new(),
            links: Vec::new(),
        };

        let diff = verify_local(&files, &paths);
        assert_eq!(diff.new.len(), 1);
        assert_eq!(diff.new[0].path(), "missing.bin");
        assert_eq!(diff.changed.len(), 1);
        let ChangedFile::Partial(file_diff) = &diff.changed[0] else {
            panic!("expected partial repair");
        };
        // First chunk intact on disk, second refetched
        assert_eq!(file_diff.old_offsets, vec![Some(0), None]);
    }

    #[test]
    fn test_installer_link_serves_raw_url() {
        let link = installer_link("1000", "https://cdn.example.com/installer.sh");
        assert_eq!(link.raw_url(), "https://cdn.example.com/installer.sh");
    }
}
