//! Free-space probing for the planner's scratch projection

use crate::Result;
use std::path::Path;

/// Bytes available to unprivileged writers at `path`.
///
/// The deepest existing ancestor is probed so the check works before the
/// install directory has been created.
pub fn available_space(path: &Path) -> Result<u64> {
    let mut probe = path;
    while !probe.exists() {
        match probe.parent() {
            Some(parent) => probe = parent,
            None => break,
        }
    }
    available_space_at(probe)
}

#[cfg(unix)]
fn available_space_at(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| std::io::Error::other(format!("statvfs({}): {e}", path.display())))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
fn available_space_at(_path: &Path) -> Result<u64> {
    // Windows builds skip the projection rather than guessing.
    Ok(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_space_for_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_space(dir.path()).unwrap() > 0);
    }

    #[test]
    fn test_walks_up_for_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not/yet/created");
        assert!(available_space(&missing).unwrap() > 0);
    }
}
