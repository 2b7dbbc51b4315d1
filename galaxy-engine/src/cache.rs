//! Chunk cache
//!
//! `<install>/.gogdl-download-cache` stores decompressed chunks needed by
//! more than one consumer within a run, named by their uncompressed MD5.
//! Entries are written by the writer on `OFFLOAD_TO_CACHE`, deleted by
//! planner-emitted delete tasks once their last consumer ran, and the whole
//! directory is removed after a clean run. A crash leaves entries behind on
//! purpose: the next planner run turns their consumers into cache reads.

use crate::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Cache directory name under the install root
pub const CACHE_DIR_NAME: &str = ".gogdl-download-cache";

/// On-disk content-addressed chunk store
#[derive(Debug, Clone)]
pub struct ChunkCache {
    dir: PathBuf,
}

impl ChunkCache {
    /// Cache co-located with an install root
    pub fn new(install_root: impl AsRef<Path>) -> Self {
        Self {
            dir: install_root.as_ref().join(CACHE_DIR_NAME),
        }
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the entry for an uncompressed MD5
    pub fn entry_path(&self, md5: &str) -> PathBuf {
        self.dir.join(md5)
    }

    /// Uncompressed MD5s already present (crash leftovers from a prior run)
    pub fn existing_entries(&self) -> Result<HashSet<String>> {
        let mut entries = HashSet::new();
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        for entry in read_dir {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    entries.insert(name.to_string());
                }
            }
        }
        if !entries.is_empty() {
            debug!("found {} cached chunks from a previous run", entries.len());
        }
        Ok(entries)
    }

    /// Remove the whole cache after a clean run
    pub fn remove_all(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
