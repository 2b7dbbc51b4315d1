//! Writer
//!
//! Exactly one writer mutates the filesystem. It holds at most one open file
//! handle, executes its ordered queue strictly in sequence and reports every
//! outcome to the writer-result collector (which owns journal appends and
//! segment releases). All digests of the file being assembled are computed
//! here, on the bytes actually written.

use crate::arena::Segment;
use crate::journal::JournalEntry;
use crate::paths::TargetPaths;
use crate::task::{ChunkTask, FileTask, TaskFlags, V1Task};
use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Message consumed by the writer thread
pub enum WriterMessage {
    Op(WriterOp),
    /// Terminate sentinel
    Exit,
}

/// One writer operation, derived from the task stream head
pub enum WriterOp {
    /// File-level operation (open, close, create, rename, ...)
    File(FileTask),
    /// Append a downloaded Gen-2 chunk held in an arena segment
    Segment { chunk: ChunkTask, segment: Segment },
    /// Append a downloaded Gen-1 / installer piece held in a segment
    V1Segment { task: V1Task, segment: Segment },
    /// Append a byte range of an existing file
    OldRange { chunk: ChunkTask },
    /// Append a chunk from the cache directory
    CacheRead { chunk: ChunkTask },
}

/// Outcome posted for every executed operation
pub struct WriterResult {
    /// Uncompressed bytes written by this operation
    pub written: u64,
    /// Consumed segment, handed back for release into the arena
    pub segment: Option<Segment>,
    /// Journal entry to append (file completed)
    pub journal: Option<JournalEntry>,
    /// Old-range verification failed; the orchestrator refetches this chunk
    pub redownload: Option<ChunkTask>,
    /// Fatal failure; the run aborts
    pub error: Option<Error>,
}

impl WriterResult {
    fn ok(written: u64) -> Self {
        Self {
            written,
            segment: None,
            journal: None,
            redownload: None,
            error: None,
        }
    }

    fn failed(error: Error) -> Self {
        Self {
            written: 0,
            segment: None,
            journal: None,
            redownload: None,
            error: Some(error),
        }
    }
}

/// The file currently being assembled
struct OpenFile {
    handle: File,
    /// Path as named by the OPEN task (may carry a `.tmp` suffix)
    task_path: String,
    md5: md5::Context,
    crc: flate2::Crc,
    written: u64,
}

/// Writer state, driven by [`run_writer`]
pub struct Writer {
    paths: TargetPaths,
    current: Option<OpenFile>,
}

/// Blocking writer loop, run on its own thread
pub fn run_writer(
    paths: TargetPaths,
    rx: std::sync::mpsc::Receiver<WriterMessage>,
    tx: tokio::sync::mpsc::UnboundedSender<WriterResult>,
) {
    let mut writer = Writer {
        paths,
        current: None,
    };
    debug!("writer up");
    while let Ok(message) = rx.recv() {
        let WriterMessage::Op(op) = message else {
            break;
        };
        let result = writer.execute(op);
        if tx.send(result).is_err() {
            break;
        }
    }
    debug!("writer down");
}

impl Writer {
    /// Execute one operation, never panicking on IO failure
    pub fn execute(&mut self, op: WriterOp) -> WriterResult {
        match op {
            WriterOp::File(task) => match self.file_op(&task) {
                Ok(result) => result,
                Err(e) => WriterResult::failed(e),
            },
            WriterOp::Segment { chunk, segment } => self.append_segment(chunk, segment, false),
            WriterOp::V1Segment { task, segment } => {
                let zip_deflate = task.zip_deflate;
                let chunk = ChunkTask {
                    product_id: task.product_id,
                    link_key: task.link_key,
                    path: task.path,
                    index: task.index,
                    compressed_md5: String::new(),
                    md5: String::new(),
                    size: task.target_size,
                    compressed_size: task.size,
                    source: crate::task::ChunkSource::Download,
                    offload_to_cache: false,
                    cleanup: false,
                };
                self.append_segment(chunk, segment, zip_deflate)
            }
            WriterOp::OldRange { chunk } => self.append_old_range(chunk),
            WriterOp::CacheRead { chunk } => self.append_cache(chunk),
        }
    }

    fn file_op(&mut self, task: &FileTask) -> Result<WriterResult> {
        let flags = task.flags;
        let path = self.paths.resolve_task(task);

        if flags.contains(TaskFlags::OPEN_FILE) {
            if self.current.is_some() {
                return Err(Error::structural(format!(
                    "OPEN {} while another file is open",
                    task.path
                )));
            }
            prepare_parent(&path)?;
            let handle = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?;
            self.current = Some(OpenFile {
                handle,
                task_path: task.path.clone(),
                md5: md5::Context::new(),
                crc: flate2::Crc::new(),
                written: 0,
            });
            return Ok(WriterResult::ok(0));
        }

        if flags.contains(TaskFlags::CLOSE_FILE) {
            let open = self.current.take().ok_or_else(|| {
                Error::structural(format!("CLOSE {} with no open file", task.path))
            })?;
            open.handle.sync_data()?;
            let md5_hex = format!("{:x}", open.md5.finalize());
            let crc_hex = format!("{:08x}", open.crc.sum());
            if let Some(expected) = &task.checksum {
                let actual = if expected.len() == 8 { &crc_hex } else { &md5_hex };
                if actual != expected {
                    return Err(Error::FileChecksum {
                        path: task.path.clone(),
                        expected: expected.clone(),
                        actual: actual.clone(),
                    });
                }
            }
            let mut result = WriterResult::ok(0);
            result.journal = self.journal_entry(task);
            debug!("closed {} ({} bytes)", open.task_path, open.written);
            return Ok(result);
        }

        if flags.contains(TaskFlags::CREATE_FILE) {
            prepare_parent(&path)?;
            if !path.exists() {
                File::create(&path)?;
            }
            let mut result = WriterResult::ok(0);
            result.journal = self.journal_entry(task);
            return Ok(result);
        }

        if flags.contains(TaskFlags::RENAME_FILE) {
            let old_rel = task
                .old_path
                .as_ref()
                .ok_or_else(|| Error::structural("RENAME without a source path"))?;
            let source = self.paths.resolve(old_rel, flags, &task.product_id);
            if flags.contains(TaskFlags::DELETE_TARGET) && path.exists() {
                std::fs::remove_file(&path)?;
            }
            prepare_parent(&path)?;
            std::fs::rename(&source, &path)?;
            let mut result = WriterResult::ok(0);
            result.journal = self.journal_entry(task);
            return Ok(result);
        }

        if flags.contains(TaskFlags::DELETE_FILE) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(WriterResult::ok(0));
        }

        if flags.contains(TaskFlags::COPY_FILE) {
            let old_rel = task
                .old_path
                .as_ref()
                .ok_or_else(|| Error::structural("COPY without a source path"))?;
            let source = self.paths.resolve(old_rel, flags, &task.product_id);
            prepare_parent(&path)?;
            let written = std::fs::copy(&source, &path)?;
            let mut result = WriterResult::ok(written);
            result.journal = self.journal_entry(task);
            return Ok(result);
        }

        if flags.contains(TaskFlags::MAKE_EXE) {
            make_executable(&path)?;
            return Ok(WriterResult::ok(0));
        }

        if flags.contains(TaskFlags::CREATE_SYMLINK) {
            let target = task
                .link_target
                .as_ref()
                .ok_or_else(|| Error::structural("CREATE_SYMLINK without a target"))?;
            prepare_parent(&path)?;
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            create_symlink(target, &path)?;
            return Ok(WriterResult::ok(0));
        }

        if flags.contains(TaskFlags::PATCH) {
            return self.apply_patch(task, &path);
        }

        Err(Error::structural(format!(
            "file task {} with no actionable flags: {:?}",
            task.path, flags
        )))
    }

    /// Append downloaded bytes from a segment; optionally inflate a raw
    /// deflate stream (installer entries) and offload shared chunks to the
    /// cache
    fn append_segment(
        &mut self,
        chunk: ChunkTask,
        segment: Segment,
        zip_deflate: bool,
    ) -> WriterResult {
        let outcome = (|| -> Result<u64> {
            if chunk.offload_to_cache {
                let entry = self.paths.cache.entry_path(&chunk.md5);
                prepare_parent(&entry)?;
                std::fs::write(&entry, segment.data())?;
            }
            if zip_deflate {
                let mut inflated = Vec::with_capacity(chunk.size as usize);
                flate2::read::DeflateDecoder::new(segment.data()).read_to_end(&mut inflated)?;
                self.append_bytes(&inflated)
            } else {
                self.append_bytes(segment.data())
            }
        })();

        let mut result = match outcome {
            Ok(written) => WriterResult::ok(written),
            Err(e) => WriterResult::failed(e),
        };
        result.segment = Some(segment);
        result
    }

    /// Append a verified byte range of an existing file (chunk reuse)
    fn append_old_range(&mut self, chunk: ChunkTask) -> WriterResult {
        let crate::task::ChunkSource::OldFile { path, offset } = chunk.source.clone() else {
            return WriterResult::failed(Error::structural("OldRange without an old-file source"));
        };
        let outcome = (|| -> Result<u64> {
            let source_path = self.paths.resolve_install(&path);
            let mut source = File::open(&source_path)?;
            source.seek(SeekFrom::Start(offset))?;
            let mut data = vec![0u8; chunk.size as usize];
            source.read_exact(&mut data)?;

            if hex::encode(md5::compute(&data).0) != chunk.md5 {
                return Err(Error::Integrity {
                    chunk: chunk.md5.clone(),
                    path: chunk.path.clone(),
                });
            }
            self.append_bytes(&data)
        })();

        match outcome {
            Ok(written) => WriterResult::ok(written),
            Err(Error::Integrity { .. }) => {
                // The old file no longer holds the expected bytes; fall back
                // to fetching the chunk.
                warn!(
                    "old-file range for chunk {} of {} failed verification, refetching",
                    chunk.md5, chunk.path
                );
                let mut refetch = chunk;
                refetch.source = crate::task::ChunkSource::Download;
                WriterResult {
                    written: 0,
                    segment: None,
                    journal: None,
                    redownload: Some(refetch),
                    error: None,
                }
            }
            Err(e) => WriterResult::failed(e),
        }
    }

    /// Append a previously offloaded chunk from the cache
    fn append_cache(&mut self, chunk: ChunkTask) -> WriterResult {
        let outcome = (|| -> Result<u64> {
            let entry = self.paths.cache.entry_path(&chunk.md5);
            let data = std::fs::read(&entry)?;
            if data.len() as u64 != chunk.size {
                return Err(Error::Integrity {
                    chunk: chunk.md5.clone(),
                    path: chunk.path.clone(),
                });
            }
            self.append_bytes(&data)
        })();

        match outcome {
            Ok(written) => WriterResult::ok(written),
            Err(Error::Integrity { .. }) | Err(Error::Io(_)) => {
                warn!(
                    "cache entry for chunk {} of {} unusable, refetching",
                    chunk.md5, chunk.path
                );
                let mut refetch = chunk;
                refetch.source = crate::task::ChunkSource::Download;
                refetch.offload_to_cache = false;
                refetch.cleanup = false;
                WriterResult {
                    written: 0,
                    segment: None,
                    journal: None,
                    redownload: Some(refetch),
                    error: None,
                }
            }
            Err(e) => WriterResult::failed(e),
        }
    }

    fn append_bytes(&mut self, data: &[u8]) -> Result<u64> {
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| Error::structural("append with no open file"))?;
        open.handle.write_all(data)?;
        open.md5.consume(data);
        open.crc.update(data);
        open.written += data.len() as u64;
        Ok(data.len() as u64)
    }

    /// Apply a VCDIFF delta: source -> temporary output, verify, move into
    /// place
    fn apply_patch(&mut self, task: &FileTask, destination: &Path) -> Result<WriterResult> {
        let source_rel = task
            .old_path
            .as_ref()
            .ok_or_else(|| Error::structural("PATCH without a source path"))?;
        let delta_rel = task
            .delta_path
            .as_ref()
            .ok_or_else(|| Error::structural("PATCH without a delta path"))?;
        let source = self.paths.resolve(source_rel, task.flags, &task.product_id);
        let delta = self.paths.cache.dir().join(delta_rel);
        let staging = destination.with_extension("patched.tmp");

        let written = galaxy_vcdiff::apply(&source, &delta, &staging)?;

        if let Some(expected) = &task.checksum {
            let actual = hash_file_md5(&staging)?;
            if actual != *expected {
                std::fs::remove_file(&staging).ok();
                return Err(Error::FileChecksum {
                    path: task.path.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        if destination.exists() {
            std::fs::remove_file(destination)?;
        }
        std::fs::rename(&staging, destination)?;

        let mut result = WriterResult::ok(written);
        result.journal = self.journal_entry(task);
        Ok(result)
    }

    /// Journal entry for a completing task, when the planner asked for one
    fn journal_entry(&self, task: &FileTask) -> Option<JournalEntry> {
        if !task.flags.contains(TaskFlags::JOURNAL) {
            return None;
        }
        let checksum = task.checksum.clone()?;
        Some(JournalEntry {
            checksum,
            support: task.flags.contains(TaskFlags::SUPPORT),
            path: task.path.clone(),
        })
    }
}

fn prepare_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn hash_file_md5(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.finalize()))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    std::fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, path: &PathBuf) -> Result<()> {
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_symlink(_target: &str, _path: &PathBuf) -> Result<()> {
    // Depot links are Unix-only; Windows manifests never carry them.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ChunkSource;

    fn setup() -> (tempfile::TempDir, Writer) {
        let dir = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(dir.path().join("game"), dir.path().join("support"));
        (
            dir,
            Writer {
                paths,
                current: None,
            },
        )
    }

    fn chunk_for(path: &str, data: &[u8]) -> ChunkTask {
        ChunkTask {
            product_id: "1000".into(),
            link_key: "1000".into(),
            path: path.into(),
            index: 0,
            compressed_md5: String::new(),
            md5: hex::encode(md5::compute(data).0),
            size: data.len() as u64,
            compressed_size: data.len() as u64,
            source: ChunkSource::Download,
            offload_to_cache: false,
            cleanup: false,
        }
    }

    fn open_task(path: &str) -> FileTask {
        FileTask::new("1000", path, TaskFlags::OPEN_FILE)
    }

    fn segment_with(data: &[u8]) -> Segment {
        let mut arena = crate::arena::SharedArena::new(1024, 1024);
        let mut segment = arena.try_acquire().unwrap();
        segment.buffer().extend_from_slice(data);
        segment
    }

    #[test]
    fn test_open_append_close_journals() {
        let (dir, mut writer) = setup();
        let data = b"file content";

        assert!(
            writer
                .execute(WriterOp::File(open_task("bin/game.exe")))
                .error
                .is_none()
        );

        let result = writer.execute(WriterOp::Segment {
            chunk: chunk_for("bin/game.exe", data),
            segment: segment_with(data),
        });
        assert!(result.error.is_none());
        assert_eq!(result.written, data.len() as u64);
        assert!(result.segment.is_some());

        let mut close = FileTask::new(
            "1000",
            "bin/game.exe",
            TaskFlags::CLOSE_FILE | TaskFlags::JOURNAL,
        );
        close.checksum = Some(hex::encode(md5::compute(data).0));
        let result = writer.execute(WriterOp::File(close));
        assert!(result.error.is_none(), "{:?}", result.error.map(|e| e.to_string()));
        let entry = result.journal.unwrap();
        assert_eq!(entry.path, "bin/game.exe");

        let on_disk = std::fs::read(dir.path().join("game/bin/game.exe")).unwrap();
        assert_eq!(on_disk, data);
    }

    #[test]
    fn test_close_detects_corruption() {
        let (_dir, mut writer) = setup();
        writer.execute(WriterOp::File(open_task("f")));
        writer.execute(WriterOp::Segment {
            chunk: chunk_for("f", b"actual"),
            segment: segment_with(b"actual"),
        });

        let mut close = FileTask::new("1000", "f", TaskFlags::CLOSE_FILE);
        close.checksum = Some("00000000000000000000000000000000".into());
        let result = writer.execute(WriterOp::File(close));
        assert!(matches!(result.error, Some(Error::FileChecksum { .. })));
    }

    #[test]
    fn test_double_open_rejected() {
        let (_dir, mut writer) = setup();
        assert!(writer.execute(WriterOp::File(open_task("a"))).error.is_none());
        let result = writer.execute(WriterOp::File(open_task("b")));
        assert!(matches!(result.error, Some(Error::Structural { .. })));
    }

    #[test]
    fn test_offload_writes_cache_entry() {
        let (dir, mut writer) = setup();
        let data = b"shared chunk";
        writer.execute(WriterOp::File(open_task("x")));

        let mut chunk = chunk_for("x", data);
        chunk.offload_to_cache = true;
        let md5sum = chunk.md5.clone();
        let result = writer.execute(WriterOp::Segment {
            chunk,
            segment: segment_with(data),
        });
        assert!(result.error.is_none());

        let cached = std::fs::read(
            dir.path()
                .join("game/.gogdl-download-cache")
                .join(&md5sum),
        )
        .unwrap();
        assert_eq!(cached, data);
    }

    #[test]
    fn test_cache_read_appends() {
        let (dir, mut writer) = setup();
        let data = b"cached bytes";
        let cache_dir = dir.path().join("game/.gogdl-download-cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        let mut chunk = chunk_for("y", data);
        chunk.source = ChunkSource::Cache;
        std::fs::write(cache_dir.join(&chunk.md5), data).unwrap();

        writer.execute(WriterOp::File(open_task("y")));
        let result = writer.execute(WriterOp::CacheRead { chunk });
        assert!(result.error.is_none());
        assert_eq!(result.written, data.len() as u64);
    }

    #[test]
    fn test_old_range_reuse_and_fallback() {
        let (dir, mut writer) = setup();
        std::fs::create_dir_all(dir.path().join("game")).unwrap();
        std::fs::write(dir.path().join("game/old.bin"), b"AAAABBBBCCCC").unwrap();

        writer.execute(WriterOp::File(open_task("new.bin")));

        // Matching range is appended
        let mut chunk = chunk_for("new.bin", b"BBBB");
        chunk.source = ChunkSource::OldFile {
            path: "old.bin".into(),
            offset: 4,
        };
        let result = writer.execute(WriterOp::OldRange {
            chunk: chunk.clone(),
        });
        assert!(result.error.is_none());
        assert_eq!(result.written, 4);
        assert!(result.redownload.is_none());

        // Range that no longer matches falls back to a download
        chunk.md5 = "11111111111111111111111111111111".into();
        let result = writer.execute(WriterOp::OldRange { chunk });
        assert!(result.error.is_none());
        let refetch = result.redownload.unwrap();
        assert_eq!(refetch.source, ChunkSource::Download);
    }

    #[test]
    fn test_rename_with_delete_target() {
        let (dir, mut writer) = setup();
        std::fs::create_dir_all(dir.path().join("game")).unwrap();
        std::fs::write(dir.path().join("game/f.tmp"), b"new").unwrap();
        std::fs::write(dir.path().join("game/f"), b"old").unwrap();

        let mut rename = FileTask::new(
            "1000",
            "f",
            TaskFlags::RENAME_FILE | TaskFlags::DELETE_TARGET | TaskFlags::JOURNAL,
        );
        rename.old_path = Some("f.tmp".into());
        rename.checksum = Some("aa".into());
        let result = writer.execute(WriterOp::File(rename));
        assert!(result.error.is_none());
        assert!(result.journal.is_some());
        assert_eq!(std::fs::read(dir.path().join("game/f")).unwrap(), b"new");
        assert!(!dir.path().join("game/f.tmp").exists());
    }

    #[test]
    fn test_delete_missing_file_is_ok() {
        let (_dir, mut writer) = setup();
        let task = FileTask::new("1000", "not-there", TaskFlags::DELETE_FILE);
        assert!(writer.execute(WriterOp::File(task)).error.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_recreated() {
        let (dir, mut writer) = setup();
        std::fs::create_dir_all(dir.path().join("game")).unwrap();
        std::fs::write(dir.path().join("game/target.txt"), b"t").unwrap();

        let mut link = FileTask::new("1000", "link", TaskFlags::CREATE_SYMLINK);
        link.link_target = Some("target.txt".into());
        assert!(writer.execute(WriterOp::File(link.clone())).error.is_none());
        // Idempotent: existing link is replaced
        assert!(writer.execute(WriterOp::File(link)).error.is_none());

        let dest = std::fs::read_link(dir.path().join("game/link")).unwrap();
        assert_eq!(dest, PathBuf::from("target.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_make_executable() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, mut writer) = setup();
        std::fs::create_dir_all(dir.path().join("game")).unwrap();
        std::fs::write(dir.path().join("game/run.sh"), b"#!/bin/sh").unwrap();

        let task = FileTask::new("1000", "run.sh", TaskFlags::MAKE_EXE);
        assert!(writer.execute(WriterOp::File(task)).error.is_none());
        let mode = std::fs::metadata(dir.path().join("game/run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_zip_deflate_segment_inflated() {
        use flate2::Compression;
        use flate2::write::DeflateEncoder;

        let (dir, mut writer) = setup();
        let payload = b"installer entry payload";
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let deflated = encoder.finish().unwrap();

        writer.execute(WriterOp::File(open_task("game.bin")));
        let task = V1Task {
            product_id: "1000".into(),
            link_key: "linux:1000".into(),
            path: "game.bin".into(),
            index: 0,
            offset: 0,
            size: deflated.len() as u64,
            target_size: payload.len() as u64,
            resolve_zip_header: true,
            zip_deflate: true,
        };
        let result = writer.execute(WriterOp::V1Segment {
            task,
            segment: segment_with(&deflated),
        });
        assert!(result.error.is_none());
        assert_eq!(result.written, payload.len() as u64);

        let mut close = FileTask::new("1000", "game.bin", TaskFlags::CLOSE_FILE);
        // CRC-32 of the inflated payload
        let mut crc = flate2::Crc::new();
        crc.update(payload);
        close.checksum = Some(format!("{:08x}", crc.sum()));
        let result = writer.execute(WriterOp::File(close));
        assert!(result.error.is_none());
        assert_eq!(
            std::fs::read(dir.path().join("game/game.bin")).unwrap(),
            payload
        );
    }
}
