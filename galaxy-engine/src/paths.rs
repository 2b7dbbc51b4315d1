//! Target path resolution
//!
//! Manifest paths are install-relative. Support files are re-rooted under
//! `<support>/<product-id>/`, cache-relative paths under the chunk cache.
//! On case-sensitive filesystems an existing tree may disagree with the
//! manifest's casing, so resolution walks the existing prefix and picks
//! siblings whose lower-cased name matches (best effort, with a warning
//! when the match is ambiguous).

use crate::cache::ChunkCache;
use crate::task::{FileTask, TaskFlags};
use std::path::{Path, PathBuf};
use tracing::warn;

/// The three roots a task path can resolve against
#[derive(Debug, Clone)]
pub struct TargetPaths {
    pub install_root: PathBuf,
    pub support_root: PathBuf,
    pub cache: ChunkCache,
}

impl TargetPaths {
    pub fn new(
        install_root: impl Into<PathBuf>,
        support_root: impl Into<PathBuf>,
    ) -> Self {
        let install_root = install_root.into();
        let cache = ChunkCache::new(&install_root);
        Self {
            install_root,
            support_root: support_root.into(),
            cache,
        }
    }

    /// Absolute path for a task's primary path
    pub fn resolve_task(&self, task: &FileTask) -> PathBuf {
        self.resolve(&task.path, task.flags, &task.product_id)
    }

    /// Absolute path for a (path, flags) pair
    pub fn resolve(&self, rel: &str, flags: TaskFlags, product_id: &str) -> PathBuf {
        if flags.contains(TaskFlags::CACHE_PATH) {
            return self.cache.dir().join(rel);
        }
        let base = if flags.contains(TaskFlags::SUPPORT) {
            self.support_root.join(product_id)
        } else {
            self.install_root.clone()
        };
        case_insensitive_resolve(&base, rel)
    }

    /// Absolute path of an install-relative file (no support routing)
    pub fn resolve_install(&self, rel: &str) -> PathBuf {
        case_insensitive_resolve(&self.install_root, rel)
    }
}

/// Walk the existing prefix of `base/rel`, substituting each missing
/// component with an existing sibling of the same lower-cased name.
///
/// Components with no existing counterpart are kept as requested, so the
/// result is always usable for creation.
pub fn case_insensitive_resolve(base: &Path, rel: &str) -> PathBuf {
    let mut current = base.to_path_buf();
    for component in Path::new(rel).components() {
        let std::path::Component::Normal(name) = component else {
            continue;
        };
        let direct = current.join(name);
        if direct.exists() || !current.is_dir() {
            current = direct;
            continue;
        }

        let wanted = name.to_string_lossy().to_lowercase();
        let mut matches = Vec::new();
        if let Ok(read_dir) = std::fs::read_dir(&current) {
            for entry in read_dir.flatten() {
                if entry.file_name().to_string_lossy().to_lowercase() == wanted {
                    matches.push(entry.file_name());
                }
            }
        }
        match matches.len() {
            0 => current = direct,
            1 => current = current.join(&matches[0]),
            _ => {
                warn!(
                    "ambiguous case-insensitive match for {:?} under {:?}, using {:?}",
                    name, current, matches[0]
                );
                current = current.join(&matches[0]);
            }
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Data")).unwrap();
        std::fs::write(dir.path().join("Data/file.txt"), b"x").unwrap();

        let resolved = case_insensitive_resolve(dir.path(), "Data/file.txt");
        assert_eq!(resolved, dir.path().join("Data/file.txt"));
    }

    #[test]
    fn test_resolve_falls_back_to_sibling() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("DATA")).unwrap();
        std::fs::write(dir.path().join("DATA/File.txt"), b"x").unwrap();

        let resolved = case_insensitive_resolve(dir.path(), "data/file.txt");
        assert_eq!(resolved, dir.path().join("DATA/File.txt"));
    }

    #[test]
    fn test_resolve_keeps_missing_components() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = case_insensitive_resolve(dir.path(), "new/tree/file.bin");
        assert_eq!(resolved, dir.path().join("new/tree/file.bin"));
    }

    #[test]
    fn test_support_rerooting() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(dir.path().join("game"), dir.path().join("support"));
        let task = FileTask::new("1207", "setup/config.ini", TaskFlags::SUPPORT);
        assert_eq!(
            paths.resolve_task(&task),
            dir.path().join("support/1207/setup/config.ini")
        );
    }

    #[test]
    fn test_cache_routing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(dir.path().join("game"), dir.path().join("support"));
        let task = FileTask::new("1207", "aabbccdd", TaskFlags::CACHE_PATH);
        assert_eq!(
            paths.resolve_task(&task),
            dir.path().join("game/.gogdl-download-cache/aabbccdd")
        );
    }
}
