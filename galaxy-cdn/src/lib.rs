//! HTTP plumbing for the GOG Galaxy content system.
//!
//! Provides a retrying [`CdnClient`] for chunk and metadata downloads, the
//! content-system API surface (builds, product manifests, depot manifests,
//! patches, dependency repository) and secure-link acquisition.
//!
//! Chunks and manifest blobs are content-addressed: an MD5 hash maps to a
//! CDN path via [`galaxy_path`], where the first two hex pairs become
//! directory levels (`abcdef...` becomes `ab/cd/abcdef...`).

pub mod api;
pub mod client;
pub mod error;
pub mod secure_link;

pub use api::ApiClient;
pub use client::{CdnClient, CdnClientBuilder};
pub use error::{Error, Result};
pub use secure_link::{Endpoint, SecureLink};

/// Base URL of the plain CDN (manifest metadata)
pub const GOG_CDN: &str = "https://cdn.gog.com";

/// Base URL of the content-system API
pub const GOG_CONTENT_SYSTEM: &str = "https://content-system.gog.com";

/// Provides bearer tokens for authenticated content-system requests.
///
/// Token refresh is a concern of the caller; the engine only ever asks for
/// the current token.
pub trait AuthProvider: Send + Sync {
    /// Current bearer token, if the caller is authenticated
    fn bearer_token(&self) -> Option<String>;
}

/// Map a content hash to its CDN path: `ab/cd/abcdef...`.
///
/// Hashes that already contain a separator are passed through unchanged
/// (Gen-1 manifest ids arrive pre-formed).
pub fn galaxy_path(hash: &str) -> String {
    if hash.contains('/') || hash.len() < 4 {
        return hash.to_string();
    }
    format!("{}/{}/{}", &hash[0..2], &hash[2..4], hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_galaxy_path() {
        assert_eq!(
            galaxy_path("aabbccdd00112233445566778899aabb"),
            "aa/bb/aabbccdd00112233445566778899aabb"
        );
    }

    #[test]
    fn test_galaxy_path_preformed() {
        assert_eq!(galaxy_path("aa/bb/aabbcc"), "aa/bb/aabbcc");
    }

    #[test]
    fn test_galaxy_path_short() {
        assert_eq!(galaxy_path("ab"), "ab");
    }
}
