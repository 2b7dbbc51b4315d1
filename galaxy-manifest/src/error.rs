//! Error types for manifest parsing and storage

use thiserror::Error;

/// Error types for manifest operations
#[derive(Error, Debug)]
pub enum Error {
    /// Metadata fetch failed
    #[error("Metadata fetch failed: {0}")]
    Cdn(#[from] galaxy_cdn::Error),

    /// Manifest JSON did not have the expected shape
    #[error("Invalid manifest: {reason}")]
    InvalidManifest {
        /// What was wrong with the document
        reason: String,
    },

    /// Content-system generation outside {1, 2}
    #[error("Unsupported content-system generation {generation}")]
    UnsupportedGeneration {
        /// Generation tag found in the build descriptor
        generation: u32,
    },

    /// JSON (de)serialization failed
    #[error("Manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error from the manifest store
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for manifest operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid manifest error
    pub fn invalid_manifest(reason: impl Into<String>) -> Self {
        Self::InvalidManifest {
            reason: reason.into(),
        }
    }
}
