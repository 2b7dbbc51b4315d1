//! Error types for the download-and-apply engine

use thiserror::Error;

/// Error types for engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP or CDN failure that survived its retry budget
    #[error("CDN error: {0}")]
    Cdn(#[from] galaxy_cdn::Error),

    /// Manifest parsing or storage failure
    #[error("Manifest error: {0}")]
    Manifest(#[from] galaxy_manifest::Error),

    /// Delta patch application failed
    #[error("Patch error: {0}")]
    Patch(#[from] galaxy_vcdiff::Error),

    /// Projected scratch peak exceeds the free space at the install root
    #[error(
        "Not enough disk space: need {required} bytes, {available} available at {path}"
    )]
    NotEnoughDisk {
        /// Peak bytes the plan requires
        required: u64,
        /// Bytes reported free by the filesystem
        available: u64,
        /// Probed mount point
        path: String,
    },

    /// A chunk failed verification twice
    #[error("Integrity failure for chunk {chunk} of {path}")]
    Integrity {
        /// Compressed MD5 (or piece key) of the failing chunk
        chunk: String,
        /// File the chunk belongs to
        path: String,
    },

    /// A closed file did not hash to its manifest checksum
    #[error("Assembled file {path} hashed to {actual}, manifest says {expected}")]
    FileChecksum {
        path: String,
        expected: String,
        actual: String,
    },

    /// Input outside the supported protocol surface
    #[error("Structural error: {reason}")]
    Structural {
        /// What could not be handled
        reason: String,
    },

    /// The run was cancelled by a signal; cache and journal are retained
    #[error("Cancelled by signal")]
    Cancelled,

    /// Writer worker disappeared mid-run
    #[error("Writer terminated unexpectedly")]
    WriterGone,

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a structural error
    pub fn structural(reason: impl Into<String>) -> Self {
        Self::Structural {
            reason: reason.into(),
        }
    }

    /// Process exit code mandated for this error class
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotEnoughDisk { .. } => 2,
            Self::Cancelled => -15,
            _ => 1,
        }
    }
}
