//! Diff engine
//!
//! Compares the target manifest's file list against the previously installed
//! one and classifies every path as new, deleted or changed. Changed Gen-2
//! files are further analysed for chunk reuse (identical chunks already on
//! disk are copied instead of fetched) and for applicable binary deltas.

use galaxy_manifest::v2::DepotFile;
use galaxy_manifest::{DepotLink, FileEntry, FileList, PatchItem};
use std::collections::HashMap;
use tracing::debug;

/// A changed Gen-2 file with per-chunk reuse sources
#[derive(Debug, Clone)]
pub struct FileDiff {
    pub file: DepotFile,
    /// For each chunk of the new file, the byte offset inside the old file
    /// where an identical chunk lives; `None` means the chunk is fetched
    pub old_offsets: Vec<Option<u64>>,
}

impl FileDiff {
    /// Scan the new file's chunks in order, greedily recording the first
    /// old chunk with a matching MD5
    pub fn compare(new: &DepotFile, old: &DepotFile) -> Self {
        let mut old_offsets = Vec::with_capacity(new.chunks.len());
        for new_chunk in &new.chunks {
            let mut found = None;
            let mut offset = 0u64;
            for old_chunk in &old.chunks {
                if old_chunk.md5 == new_chunk.md5 {
                    found = Some(offset);
                    break;
                }
                offset += old_chunk.size;
            }
            old_offsets.push(found);
        }
        Self {
            file: new.clone(),
            old_offsets,
        }
    }

    /// Number of chunks that still need a download
    pub fn fetched_chunks(&self) -> usize {
        self.old_offsets.iter().filter(|o| o.is_none()).count()
    }
}

/// A changed file bound to its delta patch
#[derive(Debug, Clone)]
pub struct PatchBinding {
    pub item: PatchItem,
    pub file: DepotFile,
}

/// How a changed file is brought up to date
#[derive(Debug, Clone)]
pub enum ChangedFile {
    /// Refetched in full
    Whole(FileEntry),
    /// Assembled from reused old-file ranges plus fetched chunks
    Partial(FileDiff),
    /// Rebuilt by applying a VCDIFF delta
    Patched(PatchBinding),
}

impl ChangedFile {
    /// Target path of the changed file
    pub fn path(&self) -> &str {
        match self {
            Self::Whole(entry) => entry.path(),
            Self::Partial(diff) => &diff.file.path,
            Self::Patched(binding) => &binding.file.path,
        }
    }
}

/// Classified difference between two manifests
#[derive(Debug, Default)]
pub struct Diff {
    pub new: Vec<FileEntry>,
    pub deleted: Vec<FileEntry>,
    pub changed: Vec<ChangedFile>,
    pub redist: Vec<FileEntry>,
    pub removed_redist: Vec<FileEntry>,
    pub links: Vec<DepotLink>,
}

impl Diff {
    /// Compare a target file list against the previous install.
    ///
    /// Path keys are lower-cased; symlinks always land in `links` (the
    /// writer recreates them idempotently after all file content).
    pub fn compare(new: &FileList, old: Option<&FileList>, patches: Option<&[PatchItem]>) -> Self {
        let mut diff = Self {
            links: new.links.clone(),
            ..Self::default()
        };

        let Some(old) = old else {
            diff.new = new.files.clone();
            return diff;
        };

        let new_by_path: HashMap<String, &FileEntry> = new
            .files
            .iter()
            .map(|f| (f.path().to_lowercase(), f))
            .collect();
        let old_by_path: HashMap<String, &FileEntry> = old
            .files
            .iter()
            .map(|f| (f.path().to_lowercase(), f))
            .collect();
        let patch_by_path: HashMap<String, &PatchItem> = patches
            .unwrap_or_default()
            .iter()
            .map(|p| (p.path.to_lowercase(), p))
            .collect();

        for old_file in &old.files {
            if !new_by_path.contains_key(&old_file.path().to_lowercase()) {
                diff.deleted.push(old_file.clone());
            }
        }

        for new_file in &new.files {
            let key = new_file.path().to_lowercase();
            match old_by_path.get(&key) {
                None => diff.new.push(new_file.clone()),
                Some(old_file) => {
                    if let Some(changed) =
                        compare_entry(new_file, old_file, patch_by_path.get(&key).copied())
                    {
                        diff.changed.push(changed);
                    }
                }
            }
        }

        debug!(
            "diff: {} new, {} deleted, {} changed",
            diff.new.len(),
            diff.deleted.len(),
            diff.changed.len()
        );
        diff
    }

    /// Number of files the run will produce
    pub fn produced_files(&self) -> usize {
        self.new.len() + self.changed.len() + self.redist.len()
    }
}

/// Classify one path that exists on both sides; `None` means unchanged
fn compare_entry(
    new: &FileEntry,
    old: &FileEntry,
    patch: Option<&PatchItem>,
) -> Option<ChangedFile> {
    match (new, old) {
        // Gen-1 installation upgrading to a Gen-2 target: the only usable
        // comparison is the old raw-file hash against the new composite MD5.
        (FileEntry::V2(new_file), FileEntry::V1(old_file)) => {
            let new_sum = new_file.final_checksum()?;
            (old_file.hash != new_sum).then(|| ChangedFile::Whole(new.clone()))
        }

        (FileEntry::V1(new_file), FileEntry::V1(old_file)) => {
            (new_file.hash != old_file.hash).then(|| ChangedFile::Whole(new.clone()))
        }

        (FileEntry::Linux(new_file), FileEntry::Linux(old_file)) => {
            (new_file.crc32 != old_file.crc32).then(|| ChangedFile::Whole(new.clone()))
        }

        (FileEntry::V2(new_file), FileEntry::V2(old_file)) => {
            compare_v2(new_file, old_file, patch)
        }

        // Any other generation change: refetch in full.
        _ => Some(ChangedFile::Whole(new.clone())),
    }
}

fn compare_v2(
    new: &DepotFile,
    old: &DepotFile,
    patch: Option<&PatchItem>,
) -> Option<ChangedFile> {
    // A delta applies when the installed file still hashes to the patch's
    // declared source.
    if let Some(item) = patch {
        if old.final_checksum() == Some(item.md5_source.as_str())
            && new.final_checksum() == Some(item.md5_target.as_str())
        {
            return Some(ChangedFile::Patched(PatchBinding {
                item: item.clone(),
                file: new.clone(),
            }));
        }
    }

    if new.chunks.len() == 1 && old.chunks.len() == 1 {
        let differs = new.chunks[0].md5 != old.chunks[0].md5;
        return differs.then(|| ChangedFile::Whole(FileEntry::V2(new.clone())));
    }

    let differs = match (&new.md5, &old.md5) {
        (Some(a), Some(b)) => a != b,
        _ => match (&new.sha256, &old.sha256) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        },
    };

    (differs || new.chunks.len() != old.chunks.len())
        .then(|| ChangedFile::Partial(FileDiff::compare(new, old)))
}
