//! File model for Linux native installers
//!
//! Products without Linux depots ship a zip64 archive appended to a
//! self-extracting shell header. The engine's archive reader converts
//! central-directory entries into these records; they flow through the same
//! diff and task pipeline as depot files, addressed by byte ranges of the
//! remote installer.

/// One file extracted from an installer's central directory
#[derive(Debug, Clone)]
pub struct LinuxFile {
    pub product_id: String,
    pub path: String,
    /// Entry is deflate-compressed inside the archive (method 8)
    pub compressed: bool,
    /// Absolute byte offset of the entry data within the remote installer
    pub offset: u64,
    pub compressed_size: u64,
    pub size: u64,
    /// CRC-32 of the uncompressed bytes, as recorded by the archive
    pub crc32: u32,
    pub executable: bool,
}

impl LinuxFile {
    /// Checksum string recorded in the resume journal
    pub fn checksum(&self) -> String {
        format!("{:08x}", self.crc32)
    }
}
