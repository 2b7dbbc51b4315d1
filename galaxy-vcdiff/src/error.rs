//! Error types for VCDIFF decoding

use thiserror::Error;

/// Error types for patch application
#[derive(Error, Debug)]
pub enum Error {
    /// Stream does not start with the VCDIFF magic
    #[error("Not a VCDIFF stream (bad magic {magic:02x?})")]
    BadMagic {
        /// First bytes of the stream
        magic: [u8; 4],
    },

    /// Header requests a feature outside the supported subset
    #[error("Unsupported VCDIFF feature: {feature}")]
    Unsupported {
        /// Feature name (secondary compressor, custom code table, ...)
        feature: &'static str,
    },

    /// A decoded integer exceeded the wire-format bounds
    #[error("Varint overflow in {section} section")]
    VarintOverflow {
        /// Section being decoded
        section: &'static str,
    },

    /// Window checksum did not match the reconstructed bytes
    #[error("Window {window} adler32 mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Window index within the patch
        window: usize,
        /// Checksum carried by the window
        expected: u32,
        /// Checksum of the reconstructed bytes
        actual: u32,
    },

    /// COPY addressed bytes past the source segment (overlapping copy)
    #[error(
        "Overlapping COPY in window {window}: address {address} >= source segment {segment_len}"
    )]
    OverlappingCopy {
        /// Window index within the patch
        window: usize,
        /// Decoded copy address
        address: u64,
        /// Length of the window's source segment
        segment_len: u64,
    },

    /// Patch stream ended or misreported a section length
    #[error("Corrupt patch: {reason}")]
    Corrupt {
        /// What was inconsistent
        reason: String,
    },

    /// IO error against source, patch or output
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for patch application
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a corrupt-patch error
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }
}
