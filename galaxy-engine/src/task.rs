//! Task model
//!
//! The planner turns a diff into one ordered stream of tasks. File-level
//! operations are executed by the single writer; chunk tasks either name a
//! download (bound to an arena segment by the orchestrator) or a local
//! reuse source (old-file byte range or chunk cache entry).

use bitflags::bitflags;

bitflags! {
    /// File-operation flags carried by [`FileTask`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        const OPEN_FILE       = 1 << 0;
        const CLOSE_FILE      = 1 << 1;
        const CREATE_FILE     = 1 << 2;
        const RENAME_FILE     = 1 << 3;
        const DELETE_FILE     = 1 << 4;
        const COPY_FILE       = 1 << 5;
        const MAKE_EXE        = 1 << 6;
        const CREATE_SYMLINK  = 1 << 7;
        const PATCH           = 1 << 8;
        /// Route the path to the support tree instead of the install root
        const SUPPORT         = 1 << 9;
        /// Path is relative to the chunk cache directory
        const CACHE_PATH      = 1 << 10;
        /// Delete the target before renaming over it
        const DELETE_TARGET   = 1 << 11;
        /// Record the task's path and checksum in the resume journal once
        /// the operation succeeds
        const JOURNAL         = 1 << 12;
    }
}

/// A file-level operation
#[derive(Debug, Clone)]
pub struct FileTask {
    /// Product owning the file (routes support paths)
    pub product_id: String,
    /// Primary path, relative to the install root (or support/cache root
    /// depending on flags)
    pub path: String,
    pub flags: TaskFlags,
    /// Rename source, copy source or patch source
    pub old_path: Option<String>,
    /// Delta blob path for PATCH tasks (relative to the cache root)
    pub delta_path: Option<String>,
    /// Symlink target for CREATE_SYMLINK
    pub link_target: Option<String>,
    /// Expected checksum of the file being closed, journaled on CLOSE
    pub checksum: Option<String>,
}

impl FileTask {
    /// A bare operation on `path` with the given flags
    pub fn new(product_id: impl Into<String>, path: impl Into<String>, flags: TaskFlags) -> Self {
        Self {
            product_id: product_id.into(),
            path: path.into(),
            flags,
            old_path: None,
            delta_path: None,
            link_target: None,
            checksum: None,
        }
    }
}

/// Where a chunk's bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkSource {
    /// Fetch from the CDN into an arena segment
    Download,
    /// Copy a byte range of an existing file
    OldFile { path: String, offset: u64 },
    /// Read a previously offloaded chunk from the cache
    Cache,
}

/// A Gen-2 chunk of the file currently being assembled
#[derive(Debug, Clone)]
pub struct ChunkTask {
    pub product_id: String,
    /// Secure-link table key (product id, `<product>:patch`, or `redist`)
    pub link_key: String,
    /// File the chunk belongs to
    pub path: String,
    /// Chunk index within the file
    pub index: u32,
    pub compressed_md5: String,
    pub md5: String,
    /// Uncompressed size
    pub size: u64,
    pub compressed_size: u64,
    pub source: ChunkSource,
    /// First consumer of a shared chunk also writes it to the cache
    pub offload_to_cache: bool,
    /// Last cache consumer; the planner emits the cache delete right after
    pub cleanup: bool,
}

impl ChunkTask {
    /// Key under which a completed download is parked until the writer is
    /// ready for it
    pub fn ready_key(&self) -> String {
        self.compressed_md5.clone()
    }
}

/// A synthesised piece of a Gen-1 `main.bin` range or a Linux installer span
#[derive(Debug, Clone)]
pub struct V1Task {
    pub product_id: String,
    /// Secure-link table key (product id or `linux:<product>`)
    pub link_key: String,
    /// File the piece belongs to
    pub path: String,
    /// Piece index within the synthesised chunking of the file
    pub index: u32,
    /// Absolute byte offset within the remote blob
    pub offset: u64,
    /// Bytes to fetch
    pub size: u64,
    /// Uncompressed size this piece contributes to the file
    pub target_size: u64,
    /// Offset names a ZIP local file header; the data offset must be
    /// resolved by reading it first
    pub resolve_zip_header: bool,
    /// Piece is a raw-deflate stream the writer inflates on append
    pub zip_deflate: bool,
}

impl V1Task {
    /// Key under which a completed download is parked
    pub fn ready_key(&self) -> String {
        format!("{}#{}", self.path, self.index)
    }
}

/// One entry of the ordered task stream
#[derive(Debug, Clone)]
pub enum Task {
    File(FileTask),
    Chunk(ChunkTask),
    V1(V1Task),
}

impl Task {
    /// Whether the orchestrator must wait for a download before handing the
    /// task to the writer
    pub fn needs_download(&self) -> bool {
        match self {
            Task::File(_) => false,
            Task::Chunk(c) => c.source == ChunkSource::Download,
            Task::V1(_) => true,
        }
    }

    /// Ready-map key for download-backed tasks
    pub fn ready_key(&self) -> Option<String> {
        match self {
            Task::File(_) => None,
            Task::Chunk(c) => Some(c.ready_key()),
            Task::V1(v) => Some(v.ready_key()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_download() {
        let mut chunk = ChunkTask {
            product_id: "1".into(),
            link_key: "1".into(),
            path: "a".into(),
            index: 0,
            compressed_md5: "cc".into(),
            md5: "dd".into(),
            size: 10,
            compressed_size: 4,
            source: ChunkSource::Download,
            offload_to_cache: false,
            cleanup: false,
        };
        assert!(Task::Chunk(chunk.clone()).needs_download());

        chunk.source = ChunkSource::Cache;
        assert!(!Task::Chunk(chunk.clone()).needs_download());

        chunk.source = ChunkSource::OldFile {
            path: "a".into(),
            offset: 0,
        };
        assert!(!Task::Chunk(chunk).needs_download());
    }

    #[test]
    fn test_flag_composition() {
        let flags = TaskFlags::RENAME_FILE | TaskFlags::DELETE_TARGET;
        assert!(flags.contains(TaskFlags::RENAME_FILE));
        assert!(!flags.contains(TaskFlags::OPEN_FILE));
    }

    #[test]
    fn test_v1_ready_key_distinguishes_pieces() {
        let task = V1Task {
            product_id: "1".into(),
            link_key: "1".into(),
            path: "bin/data".into(),
            index: 3,
            offset: 4096,
            size: 1024,
            target_size: 1024,
            resolve_zip_header: false,
            zip_deflate: false,
        };
        assert_eq!(task.ready_key(), "bin/data#3");
    }
}
