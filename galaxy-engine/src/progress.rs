//! Structured progress events
//!
//! The engine does not render progress; it publishes snapshots on a watch
//! channel for whatever front end is attached (the CLI logs them as JSON
//! lines).

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// One progress snapshot
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProgressSnapshot {
    /// Compressed bytes fetched so far
    pub downloaded: u64,
    /// Uncompressed bytes written so far
    pub written: u64,
    /// Total compressed bytes the plan will fetch
    pub total_download: u64,
    /// Total uncompressed bytes the plan will write
    pub total_disk: u64,
    /// Files closed so far
    pub files_done: u64,
    /// Files the plan produces
    pub files_total: u64,
}

impl ProgressSnapshot {
    /// Written fraction in `[0, 1]`
    pub fn fraction(&self) -> f64 {
        if self.total_disk == 0 {
            1.0
        } else {
            self.written as f64 / self.total_disk as f64
        }
    }
}

/// Shared counters updated by the orchestrator's collectors
#[derive(Debug)]
pub struct ProgressTracker {
    downloaded: AtomicU64,
    written: AtomicU64,
    files_done: AtomicU64,
    total_download: u64,
    total_disk: u64,
    files_total: u64,
    tx: watch::Sender<ProgressSnapshot>,
}

impl ProgressTracker {
    /// Tracker for a plan with known totals
    pub fn new(total_download: u64, total_disk: u64, files_total: u64) -> (Arc<Self>, watch::Receiver<ProgressSnapshot>) {
        let initial = ProgressSnapshot {
            total_download,
            total_disk,
            files_total,
            ..Default::default()
        };
        let (tx, rx) = watch::channel(initial);
        (
            Arc::new(Self {
                downloaded: AtomicU64::new(0),
                written: AtomicU64::new(0),
                files_done: AtomicU64::new(0),
                total_download,
                total_disk,
                files_total,
                tx,
            }),
            rx,
        )
    }

    /// Record fetched compressed bytes
    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.publish();
    }

    /// Record written uncompressed bytes
    pub fn add_written(&self, bytes: u64) {
        self.written.fetch_add(bytes, Ordering::Relaxed);
        self.publish();
    }

    /// Record a closed file
    pub fn file_done(&self) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
        self.publish();
    }

    /// Current snapshot
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            downloaded: self.downloaded.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            total_download: self.total_download,
            total_disk: self.total_disk,
            files_done: self.files_done.load(Ordering::Relaxed),
            files_total: self.files_total,
        }
    }

    fn publish(&self) {
        let _ = self.tx.send(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_accumulates() {
        let (tracker, rx) = ProgressTracker::new(400, 1000, 2);
        tracker.add_downloaded(100);
        tracker.add_written(250);
        tracker.file_done();

        let snapshot = *rx.borrow();
        assert_eq!(snapshot.downloaded, 100);
        assert_eq!(snapshot.written, 250);
        assert_eq!(snapshot.files_done, 1);
        assert!((snapshot.fraction() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_plan_is_complete() {
        let (tracker, _rx) = ProgressTracker::new(0, 0, 0);
        assert!((tracker.snapshot().fraction() - 1.0).abs() < f64::EPSILON);
    }
}
