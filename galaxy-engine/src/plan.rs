//! Task planner
//!
//! Transforms a diff and the current cache/journal state into one ordered
//! task stream a single writer can execute without ever referencing a chunk
//! before it is in memory or on disk. Shared chunks are fetched once and
//! parked in the chunk cache; Gen-1 byte ranges are cut into synthetic
//! pieces so the same arena pipeline serves both generations.

use crate::diff::{ChangedFile, Diff, FileDiff};
use crate::disk;
use crate::journal::JournalEntry;
use crate::paths::TargetPaths;
use crate::task::{ChunkSource, ChunkTask, FileTask, Task, TaskFlags, V1Task};
use crate::{Error, Result};
use galaxy_manifest::v2::{Chunk, DepotFile};
use galaxy_manifest::{FileEntry, PatchItem};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

/// Smallest synthetic Gen-1 piece
const MIN_V1_PIECE: u64 = 8 * 1024 * 1024;

/// Gen-1 piece size when the plan has no Gen-2 chunks to calibrate against
const DEFAULT_V1_PIECE: u64 = 20 * 1024 * 1024;

/// MD5 of the empty input, journaled for zero-byte files
const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// An executable plan
#[derive(Debug, Default)]
pub struct Plan {
    /// Ordered task stream consumed from the front
    pub tasks: VecDeque<Task>,
    /// Compressed bytes the plan fetches
    pub download_size: u64,
    /// Uncompressed bytes the plan writes
    pub disk_size: u64,
    /// Files the plan produces (journal-elided files excluded)
    pub files_total: u64,
    /// Arena segment size: the largest buffer any single task needs
    pub segment_size: u64,
    /// Peak bytes of cache entries held at once
    pub cache_peak: u64,
}

impl Plan {
    /// Bytes of free space the plan requires at the install root
    pub fn required_space(&self) -> u64 {
        self.disk_size + self.cache_peak
    }

    /// Abort with "not enough disk" when the projected peak exceeds the
    /// space available at the install root (checked before any write)
    pub fn check_free_space(&self, paths: &TargetPaths) -> Result<()> {
        let required = self.required_space();
        if required == 0 {
            return Ok(());
        }
        let available = disk::available_space(&paths.install_root)?;
        if required > available {
            return Err(Error::NotEnoughDisk {
                required,
                available,
                path: paths.install_root.display().to_string(),
            });
        }
        Ok(())
    }

    /// Download-backed tasks in stream order (what the scheduler feeds to
    /// the worker pool)
    pub fn download_tasks(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.needs_download())
            .cloned()
            .collect()
    }
}

/// What still has to be produced after journal replay
enum WorkItem<'a> {
    Entry(&'a FileEntry),
    Changed(&'a ChangedFile),
}

/// Build the ordered task stream for a diff.
///
/// `journal` elides files a previous run already completed, `cached` lists
/// chunk-cache entries surviving a crash (keyed by uncompressed MD5).
pub fn build_plan(
    diff: &Diff,
    journal: &[JournalEntry],
    cached: &HashSet<String>,
    paths: &TargetPaths,
) -> Plan {
    Planner {
        diff,
        cached,
        done: journal_done_set(diff, journal, paths),
        plan: Plan::default(),
        multiplicity: HashMap::new(),
        offloaded: HashSet::new(),
        cache_held: 0,
        v1_seen_hashes: HashMap::new(),
        v1_piece: DEFAULT_V1_PIECE,
    }
    .build()
}

/// Lower-cased paths the journal proves complete: the recorded checksum
/// still matches the target and the file is still on disk
fn journal_done_set(
    diff: &Diff,
    journal: &[JournalEntry],
    paths: &TargetPaths,
) -> HashSet<String> {
    let mut target_sums: HashMap<String, (String, TaskFlags, String)> = HashMap::new();
    let changed_entries = diff.changed.iter().map(|c| match c {
        ChangedFile::Whole(entry) => entry.clone(),
        ChangedFile::Partial(fd) => FileEntry::V2(fd.file.clone()),
        ChangedFile::Patched(binding) => FileEntry::V2(binding.file.clone()),
    });
    for entry in diff
        .new
        .iter()
        .chain(diff.redist.iter())
        .cloned()
        .chain(changed_entries)
    {
        let Some(sum) = entry.final_checksum() else {
            continue;
        };
        let flags = if entry.is_support() {
            TaskFlags::SUPPORT
        } else {
            TaskFlags::empty()
        };
        target_sums.insert(
            entry.path().to_lowercase(),
            (sum, flags, entry.product_id().to_string()),
        );
    }

    let mut done = HashSet::new();
    for record in journal {
        let key = record.path.to_lowercase();
        let Some((sum, flags, product_id)) = target_sums.get(&key) else {
            continue;
        };
        if record.support != flags.contains(TaskFlags::SUPPORT) || record.checksum != *sum {
            continue;
        }
        if paths.resolve(&record.path, *flags, product_id).is_file() {
            done.insert(key);
        }
    }
    if !done.is_empty() {
        info!("journal elides {} already completed files", done.len());
    }
    done
}

struct Planner<'a> {
    diff: &'a Diff,
    cached: &'a HashSet<String>,
    done: HashSet<String>,
    plan: Plan,
    /// Remaining consumers per compressed MD5
    multiplicity: HashMap<String, usize>,
    offloaded: HashSet<String>,
    cache_held: u64,
    /// Gen-1 content dedup: file hash -> first planned (path, support flag)
    v1_seen_hashes: HashMap<String, FileTask>,
    v1_piece: u64,
}

impl Planner<'_> {
    fn build(mut self) -> Plan {
        let items: Vec<WorkItem> = self
            .diff
            .redist
            .iter()
            .chain(self.diff.new.iter())
            .map(WorkItem::Entry)
            .chain(self.diff.changed.iter().map(WorkItem::Changed))
            .filter(|item| {
                let path = match item {
                    WorkItem::Entry(entry) => entry.path(),
                    WorkItem::Changed(changed) => changed.path(),
                };
                !self.done.contains(&path.to_lowercase())
            })
            .collect();

        self.count_chunk_multiplicity(&items);
        self.calibrate_v1_piece(&items);

        for item in &items {
            match item {
                WorkItem::Entry(entry) => self.emit_entry(entry),
                WorkItem::Changed(changed) => self.emit_changed(changed),
            }
            self.plan.files_total += 1;
        }

        for entry in self.diff.deleted.iter().chain(self.diff.removed_redist.iter()) {
            let mut flags = TaskFlags::DELETE_FILE;
            if entry.is_support() {
                flags |= TaskFlags::SUPPORT;
            }
            self.push_file(FileTask::new(entry.product_id(), entry.path(), flags));
        }

        for link in &self.diff.links {
            let mut task = FileTask::new("", link.path.clone(), TaskFlags::CREATE_SYMLINK);
            task.link_target = Some(link.target.clone());
            self.push_file(task);
        }

        debug!(
            "plan: {} tasks, {} files, {} download bytes, {} disk bytes, segment {}",
            self.plan.tasks.len(),
            self.plan.files_total,
            self.plan.download_size,
            self.plan.disk_size,
            self.plan.segment_size
        );
        self.plan
    }

    /// Count how many consumers each fetched chunk has; a count above one
    /// makes the chunk shared (cache-backed)
    fn count_chunk_multiplicity(&mut self, items: &[WorkItem]) {
        for item in items {
            for chunk in fetched_chunks(item) {
                *self
                    .multiplicity
                    .entry(chunk.compressed_md5.clone())
                    .or_insert(0) += 1;
            }
        }
    }

    /// Piece size for synthetic Gen-1 chunking: the largest Gen-2 chunk in
    /// this plan, floored at 8 MiB; 20 MiB when no Gen-2 chunks exist
    fn calibrate_v1_piece(&mut self, items: &[WorkItem]) {
        let max_chunk = items
            .iter()
            .flat_map(|item| fetched_chunks(item))
            .map(|c| c.size)
            .max();
        self.v1_piece = match max_chunk {
            Some(size) => size.max(MIN_V1_PIECE),
            None => DEFAULT_V1_PIECE,
        };
    }

    fn emit_entry(&mut self, entry: &FileEntry) {
        match entry {
            FileEntry::V2(file) => self.emit_v2(file, None, false),
            FileEntry::V1(file) => self.emit_v1(file),
            FileEntry::Linux(file) => self.emit_linux(file),
        }
    }

    fn emit_changed(&mut self, changed: &ChangedFile) {
        match changed {
            ChangedFile::Whole(entry) => self.emit_entry(entry),
            ChangedFile::Partial(file_diff) => {
                self.emit_v2(&file_diff.file, Some(file_diff), true);
            }
            ChangedFile::Patched(binding) => self.emit_patch(&binding.file, &binding.item),
        }
    }

    fn base_flags(support: bool) -> TaskFlags {
        if support {
            TaskFlags::SUPPORT
        } else {
            TaskFlags::empty()
        }
    }

    fn emit_v2(&mut self, file: &DepotFile, reuse: Option<&FileDiff>, via_tmp: bool) {
        let support = Self::base_flags(file.is_support());

        if file.chunks.is_empty() {
            self.emit_empty(
                &file.product_id,
                &file.path,
                support,
                file.is_executable(),
                file.final_checksum().unwrap_or(EMPTY_MD5),
            );
            return;
        }

        let write_path = if via_tmp {
            format!("{}.tmp", file.path)
        } else {
            file.path.clone()
        };

        self.push_file(FileTask::new(
            &file.product_id,
            &write_path,
            TaskFlags::OPEN_FILE | support,
        ));

        for (index, chunk) in file.chunks.iter().enumerate() {
            let reused_offset = reuse.and_then(|r| r.old_offsets.get(index).copied().flatten());
            if let Some(offset) = reused_offset {
                self.push_chunk(ChunkTask {
                    product_id: file.product_id.clone(),
                    link_key: file.product_id.clone(),
                    path: file.path.clone(),
                    index: index as u32,
                    compressed_md5: chunk.compressed_md5.clone(),
                    md5: chunk.md5.clone(),
                    size: chunk.size,
                    compressed_size: chunk.compressed_size,
                    source: ChunkSource::OldFile {
                        path: file.path.clone(),
                        offset,
                    },
                    offload_to_cache: false,
                    cleanup: false,
                });
            } else {
                self.push_fetched_chunk(file, index as u32, chunk);
            }
        }

        let mut close_flags = TaskFlags::CLOSE_FILE | support;
        if !via_tmp {
            close_flags |= TaskFlags::JOURNAL;
        }
        let mut close = FileTask::new(&file.product_id, &write_path, close_flags);
        close.checksum = file.final_checksum().map(String::from);
        self.push_file(close);

        if via_tmp {
            let mut rename = FileTask::new(
                &file.product_id,
                &file.path,
                TaskFlags::RENAME_FILE | TaskFlags::DELETE_TARGET | TaskFlags::JOURNAL | support,
            );
            rename.old_path = Some(write_path);
            rename.checksum = file.final_checksum().map(String::from);
            self.push_file(rename);
        }
        if file.is_executable() {
            self.push_file(FileTask::new(
                &file.product_id,
                &file.path,
                TaskFlags::MAKE_EXE | support,
            ));
        }
    }

    /// A fetched Gen-2 chunk, routed through the cache when shared or when a
    /// previous run already left it there
    fn push_fetched_chunk(&mut self, file: &DepotFile, index: u32, chunk: &Chunk) {
        let consumers_left = self
            .multiplicity
            .get(&chunk.compressed_md5)
            .copied()
            .unwrap_or(0);
        let pre_cached = self.cached.contains(&chunk.md5);

        let (source, offload) = if pre_cached {
            (ChunkSource::Cache, false)
        } else if self.offloaded.contains(&chunk.compressed_md5) {
            // A shared chunk's first consumer already parked it in the cache.
            (ChunkSource::Cache, false)
        } else if consumers_left > 1 {
            self.offloaded.insert(chunk.compressed_md5.clone());
            (ChunkSource::Download, true)
        } else {
            (ChunkSource::Download, false)
        };

        let remaining = self
            .multiplicity
            .get_mut(&chunk.compressed_md5)
            .map(|count| {
                *count -= 1;
                *count
            })
            .unwrap_or(0);
        let last_consumer = remaining == 0 && (offload || source == ChunkSource::Cache);

        if offload {
            self.cache_held += chunk.size;
            self.plan.cache_peak = self.plan.cache_peak.max(self.cache_held);
        }

        let link_key = if file.product_id == "redist" {
            "redist".to_string()
        } else {
            file.product_id.clone()
        };

        self.push_chunk(ChunkTask {
            product_id: file.product_id.clone(),
            link_key,
            path: file.path.clone(),
            index,
            compressed_md5: chunk.compressed_md5.clone(),
            md5: chunk.md5.clone(),
            size: chunk.size,
            compressed_size: chunk.compressed_size,
            source,
            offload_to_cache: offload,
            cleanup: last_consumer,
        });

        if last_consumer {
            self.cache_held = self.cache_held.saturating_sub(chunk.size);
            self.push_file(FileTask::new(
                &file.product_id,
                &chunk.md5,
                TaskFlags::DELETE_FILE | TaskFlags::CACHE_PATH,
            ));
        }
    }

    fn emit_patch(&mut self, file: &DepotFile, item: &PatchItem) {
        let support = Self::base_flags(file.is_support());
        let delta_path = format!("{}.delta", item.md5_target);

        // Assemble the delta blob inside the cache directory.
        self.push_file(FileTask::new(
            &file.product_id,
            &delta_path,
            TaskFlags::OPEN_FILE | TaskFlags::CACHE_PATH,
        ));
        for (index, chunk) in item.chunks.iter().enumerate() {
            self.push_chunk(ChunkTask {
                product_id: file.product_id.clone(),
                link_key: format!("{}:patch", file.product_id),
                path: delta_path.clone(),
                index: index as u32,
                compressed_md5: chunk.compressed_md5.clone(),
                md5: chunk.md5.clone(),
                size: chunk.size,
                compressed_size: chunk.compressed_size,
                source: ChunkSource::Download,
                offload_to_cache: false,
                cleanup: false,
            });
        }
        self.push_file(FileTask::new(
            &file.product_id,
            &delta_path,
            TaskFlags::CLOSE_FILE | TaskFlags::CACHE_PATH,
        ));

        let mut patch = FileTask::new(
            &file.product_id,
            &file.path,
            TaskFlags::PATCH | TaskFlags::JOURNAL | support,
        );
        patch.old_path = Some(file.path.clone());
        patch.delta_path = Some(delta_path.clone());
        patch.checksum = Some(item.md5_target.clone());
        self.push_file(patch);

        self.push_file(FileTask::new(
            &file.product_id,
            &delta_path,
            TaskFlags::DELETE_FILE | TaskFlags::CACHE_PATH,
        ));
        if file.is_executable() {
            self.push_file(FileTask::new(
                &file.product_id,
                &file.path,
                TaskFlags::MAKE_EXE | support,
            ));
        }
    }

    fn emit_v1(&mut self, file: &galaxy_manifest::v1::File) {
        let support = Self::base_flags(file.support);

        if file.size == 0 {
            self.emit_empty(&file.product_id, &file.path, support, file.executable, EMPTY_MD5);
            return;
        }

        // Identical content elsewhere in this plan: copy instead of fetching
        // the range a second time.
        if let Some(first) = self.v1_seen_hashes.get(&file.hash).cloned() {
            let mut copy = FileTask::new(
                &file.product_id,
                &file.path,
                TaskFlags::COPY_FILE | TaskFlags::JOURNAL | support,
            );
            copy.old_path = Some(first.path.clone());
            copy.flags |= first.flags & TaskFlags::SUPPORT;
            copy.checksum = Some(file.hash.clone());
            self.plan.disk_size += file.size;
            self.push_file(copy);
            if file.executable {
                self.push_file(FileTask::new(
                    &file.product_id,
                    &file.path,
                    TaskFlags::MAKE_EXE | support,
                ));
            }
            return;
        }
        self.v1_seen_hashes.insert(
            file.hash.clone(),
            FileTask::new(&file.product_id, &file.path, support),
        );

        self.push_file(FileTask::new(
            &file.product_id,
            &file.path,
            TaskFlags::OPEN_FILE | support,
        ));

        let v1_close_flags = TaskFlags::CLOSE_FILE | TaskFlags::JOURNAL | support;
        let mut index = 0u32;
        let mut remaining = file.size;
        let mut offset = file.offset;
        while remaining > 0 {
            let piece = remaining.min(self.v1_piece);
            self.push_v1(V1Task {
                product_id: file.product_id.clone(),
                link_key: file.product_id.clone(),
                path: file.path.clone(),
                index,
                offset,
                size: piece,
                target_size: piece,
                resolve_zip_header: false,
                zip_deflate: false,
            });
            index += 1;
            offset += piece;
            remaining -= piece;
        }

        let mut close = FileTask::new(&file.product_id, &file.path, v1_close_flags);
        close.checksum = Some(file.hash.clone());
        self.push_file(close);

        if file.executable {
            self.push_file(FileTask::new(
                &file.product_id,
                &file.path,
                TaskFlags::MAKE_EXE | support,
            ));
        }
    }

    fn emit_linux(&mut self, file: &galaxy_manifest::LinuxFile) {
        if file.size == 0 {
            self.emit_empty(
                &file.product_id,
                &file.path,
                TaskFlags::empty(),
                file.executable,
                EMPTY_MD5,
            );
            return;
        }

        self.push_file(FileTask::new(
            &file.product_id,
            &file.path,
            TaskFlags::OPEN_FILE,
        ));
        // Deflate streams cannot be split, so an installer entry is always a
        // single piece regardless of size.
        self.push_v1(V1Task {
            product_id: file.product_id.clone(),
            link_key: format!("linux:{}", file.product_id),
            path: file.path.clone(),
            index: 0,
            offset: file.offset,
            size: file.compressed_size,
            target_size: file.size,
            resolve_zip_header: true,
            zip_deflate: file.compressed,
        });
        let mut close = FileTask::new(
            &file.product_id,
            &file.path,
            TaskFlags::CLOSE_FILE | TaskFlags::JOURNAL,
        );
        close.checksum = Some(file.checksum());
        self.push_file(close);

        if file.executable {
            self.push_file(FileTask::new(&file.product_id, &file.path, TaskFlags::MAKE_EXE));
        }
    }

    fn emit_empty(
        &mut self,
        product_id: &str,
        path: &str,
        support: TaskFlags,
        executable: bool,
        checksum: &str,
    ) {
        let mut create = FileTask::new(
            product_id,
            path,
            TaskFlags::CREATE_FILE | TaskFlags::JOURNAL | support,
        );
        create.checksum = Some(checksum.to_string());
        self.push_file(create);
        if executable {
            self.push_file(FileTask::new(product_id, path, TaskFlags::MAKE_EXE | support));
        }
    }

    fn push_file(&mut self, task: FileTask) {
        self.plan.tasks.push_back(Task::File(task));
    }

    fn push_chunk(&mut self, task: ChunkTask) {
        self.plan.disk_size += task.size;
        if task.source == ChunkSource::Download {
            self.plan.download_size += task.compressed_size;
            self.plan.segment_size = self.plan.segment_size.max(task.size);
        }
        self.plan.tasks.push_back(Task::Chunk(task));
    }

    fn push_v1(&mut self, task: V1Task) {
        self.plan.disk_size += task.target_size;
        self.plan.download_size += task.size;
        self.plan.segment_size = self.plan.segment_size.max(task.size);
        self.plan.tasks.push_back(Task::V1(task));
    }
}

/// Chunks a work item fetches (reused old-file ranges excluded)
fn fetched_chunks<'a>(item: &'a WorkItem) -> Vec<&'a Chunk> {
    match item {
        WorkItem::Entry(FileEntry::V2(file)) => file.chunks.iter().collect(),
        WorkItem::Entry(_) => Vec::new(),
        WorkItem::Changed(ChangedFile::Whole(FileEntry::V2(file))) => file.chunks.iter().collect(),
        WorkItem::Changed(ChangedFile::Whole(_)) => Vec::new(),
        WorkItem::Changed(ChangedFile::Partial(file_diff)) => file_diff
            .file
            .chunks
            .iter()
            .zip(&file_diff.old_offsets)
            .filter(|(_, reused)| reused.is_none())
            .map(|(chunk, _)| chunk)
            .collect(),
        WorkItem::Changed(ChangedFile::Patched(binding)) => binding.item.chunks.iter().collect(),
    }
}
