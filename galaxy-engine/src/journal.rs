//! Resume journal
//!
//! `<install>/.gogdl-resume` holds one line per successfully closed file:
//! `<checksum>:<support-flag>:<relative-path>`. The file is append-only; a
//! re-run replays it, probes each recorded path and skips files that are
//! still present with the target checksum.

use crate::Result;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Journal file name under the install root
pub const JOURNAL_NAME: &str = ".gogdl-resume";

/// One journaled completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub checksum: String,
    pub support: bool,
    pub path: String,
}

/// Append-only record of completed files
#[derive(Debug)]
pub struct ResumeJournal {
    path: PathBuf,
}

impl ResumeJournal {
    /// Journal co-located with an install root
    pub fn new(install_root: impl AsRef<Path>) -> Self {
        Self {
            path: install_root.as_ref().join(JOURNAL_NAME),
        }
    }

    /// Location of the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse all entries; a missing journal is an empty one.
    ///
    /// Malformed lines (partial writes from an interrupted run) are skipped.
    pub fn load(&self) -> Result<Vec<JournalEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in content.lines() {
            let mut parts = line.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(checksum), Some(support), Some(path)) if !path.is_empty() => {
                    entries.push(JournalEntry {
                        checksum: checksum.to_string(),
                        support: support == "support",
                        path: path.to_string(),
                    });
                }
                _ => warn!("skipping malformed journal line: {line:?}"),
            }
        }
        debug!("journal lists {} completed files", entries.len());
        Ok(entries)
    }

    /// Append one completion record
    pub fn record(&self, entry: &JournalEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let support = if entry.support { "support" } else { "" };
        writeln!(file, "{}:{}:{}", entry.checksum, support, entry.path)?;
        Ok(())
    }

    /// Remove the journal after a clean run
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
