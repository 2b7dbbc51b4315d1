//! Error types for content-system and CDN operations

use thiserror::Error;

/// Error types for CDN operations
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Authorization rejected by the endpoint
    #[error("Unauthorized request to {url}")]
    Unauthorized {
        /// URL that returned 401
        url: String,
    },

    /// Content not found on CDN
    #[error("Content not found: {resource}")]
    ContentNotFound {
        /// The resource that was not found
        resource: String,
    },

    /// Invalid content hash format
    #[error("Invalid content hash: {hash}")]
    InvalidHash {
        /// The invalid hash string
        hash: String,
    },

    /// Invalid response from the server
    #[error("Invalid response: {reason}")]
    InvalidResponse {
        /// Reason for the invalid response
        reason: String,
    },

    /// Rate limit exceeded
    #[error("Rate limit exceeded: retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying
        retry_after_secs: u64,
    },

    /// No endpoint in the secure-link response supports the requested generation
    #[error("No usable endpoint for generation {generation}")]
    NoEndpoint {
        /// Requested content-system generation
        generation: u32,
    },

    /// Secure link could not be acquired within the retry budget
    #[error("Secure link acquisition failed for product {product_id} after {attempts} attempts")]
    SecureLinkExhausted {
        /// Product whose link was requested
        product_id: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Zlib-wrapped payload failed to decode
    #[error("Failed to inflate response body: {0}")]
    Inflate(std::io::Error),

    /// JSON deserialization failed
    #[error("Failed to parse JSON response: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for CDN operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a content not found error
    pub fn content_not_found(resource: impl Into<String>) -> Self {
        Self::ContentNotFound {
            resource: resource.into(),
        }
    }

    /// Create an invalid hash error
    pub fn invalid_hash(hash: impl Into<String>) -> Self {
        Self::InvalidHash { hash: hash.into() }
    }

    /// Create an invalid response error
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(url: impl Into<String>) -> Self {
        Self::Unauthorized { url: url.into() }
    }

    /// Whether a retry against a fresh secure link may succeed
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}
