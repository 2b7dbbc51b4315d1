//! Token hand-off from the surrounding launcher
//!
//! Authorisation is not this tool's job: whoever invokes it (a launcher
//! with a refresh loop) supplies a bearer token via flag, environment or a
//! token file, and the engine only ever reads the current value.

use galaxy_cdn::AuthProvider;
use std::path::PathBuf;
use tracing::warn;

/// Reads the access token from a fixed source on every request
#[derive(Debug)]
pub enum TokenSource {
    /// Passed on the command line or via the environment
    Literal(String),
    /// JSON file holding `{"access_token": "..."}`; re-read every time so an
    /// external refresher can rotate it mid-run
    File(PathBuf),
    /// Anonymous (public metadata endpoints only)
    None,
}

impl AuthProvider for TokenSource {
    fn bearer_token(&self) -> Option<String> {
        match self {
            Self::Literal(token) => Some(token.clone()),
            Self::File(path) => {
                let data = std::fs::read_to_string(path).ok()?;
                match serde_json::from_str::<serde_json::Value>(&data) {
                    Ok(value) => value
                        .get("access_token")
                        .and_then(|t| t.as_str())
                        .map(String::from),
                    Err(e) => {
                        warn!("unreadable token file {}: {}", path.display(), e);
                        None
                    }
                }
            }
            Self::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_token() {
        let source = TokenSource::Literal("abc".into());
        assert_eq!(source.bearer_token().as_deref(), Some("abc"));
    }

    #[test]
    fn test_token_file_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        std::fs::write(&path, r#"{"access_token": "first"}"#).unwrap();

        let source = TokenSource::File(path.clone());
        assert_eq!(source.bearer_token().as_deref(), Some("first"));

        // Rotated by an external refresher
        std::fs::write(&path, r#"{"access_token": "second"}"#).unwrap();
        assert_eq!(source.bearer_token().as_deref(), Some("second"));
    }

    #[test]
    fn test_missing_file_is_anonymous() {
        let source = TokenSource::File(PathBuf::from("/does/not/exist.json"));
        assert!(source.bearer_token().is_none());
    }
}
