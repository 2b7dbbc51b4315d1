//! Shared arena
//!
//! A fixed memory budget is partitioned into equally sized segments, one per
//! in-flight chunk. Segments move by ownership: the pool hands a free
//! segment to the scheduler, a downloader fills it, the writer consumes it
//! and hands it back. At most `segment_count` chunks are therefore in memory
//! at any time, and no two tasks ever hold the same segment.

use tokio::sync::mpsc;

/// Default arena budget: 1 GiB
pub const DEFAULT_ARENA_SIZE: u64 = 1024 * 1024 * 1024;

/// One slot of the arena, owned by exactly one task at a time
#[derive(Debug)]
pub struct Segment {
    /// Stable slot index (diagnostics only)
    pub index: usize,
    buf: Vec<u8>,
}

impl Segment {
    /// Bytes currently held (`..len` written by the most recent owner)
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Clear and hand out the backing buffer for writing
    pub fn buffer(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Capacity of the slot
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

/// Free-segment pool backed by a channel
#[derive(Debug)]
pub struct SharedArena {
    free_tx: mpsc::Sender<Segment>,
    free_rx: mpsc::Receiver<Segment>,
    segment_count: usize,
    segment_size: u64,
}

impl SharedArena {
    /// Partition `total_size` into segments of `segment_size`.
    ///
    /// At least one segment is always allocated, even when a single chunk
    /// exceeds the configured budget.
    pub fn new(total_size: u64, segment_size: u64) -> Self {
        let segment_size = segment_size.max(1);
        let segment_count = usize::try_from(total_size / segment_size)
            .unwrap_or(1)
            .max(1);
        let (free_tx, free_rx) = mpsc::channel(segment_count);
        for index in 0..segment_count {
            let segment = Segment {
                index,
                buf: Vec::with_capacity(segment_size as usize),
            };
            free_tx
                .try_send(segment)
                .unwrap_or_else(|_| unreachable!("pool sized to segment count"));
        }
        Self {
            free_tx,
            free_rx,
            segment_count,
            segment_size,
        }
    }

    /// Number of segments, i.e. the maximum in-flight chunk parallelism
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Size of each segment
    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Take a free segment, waiting until one is released
    pub async fn acquire(&mut self) -> Option<Segment> {
        self.free_rx.recv().await
    }

    /// Take a free segment only if one is available right now
    pub fn try_acquire(&mut self) -> Option<Segment> {
        self.free_rx.try_recv().ok()
    }

    /// Handle used by result collectors to return consumed segments
    pub fn releaser(&self) -> SegmentReleaser {
        SegmentReleaser {
            free_tx: self.free_tx.clone(),
        }
    }
}

/// Clonable handle that returns segments to the free pool
#[derive(Debug, Clone)]
pub struct SegmentReleaser {
    free_tx: mpsc::Sender<Segment>,
}

impl SegmentReleaser {
    /// Return a segment to the free pool
    pub fn release(&self, mut segment: Segment) {
        segment.buf.clear();
        // The pool never exceeds its initial population, so try_send only
        // fails once the arena itself is gone (shutdown).
        let _ = self.free_tx.try_send(segment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_count() {
        let arena = SharedArena::new(100, 30);
        assert_eq!(arena.segment_count(), 3);
        assert_eq!(arena.segment_size(), 30);
    }

    #[test]
    fn test_at_least_one_segment() {
        let arena = SharedArena::new(10, 400);
        assert_eq!(arena.segment_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let mut arena = SharedArena::new(64, 32);
        let releaser = arena.releaser();

        let mut first = arena.acquire().await.unwrap();
        let _second = arena.acquire().await.unwrap();
        assert!(arena.try_acquire().is_none());

        first.buffer().extend_from_slice(b"data");
        releaser.release(first);

        let back = arena.try_acquire().unwrap();
        // Buffers come back cleared
        assert!(back.data().is_empty());
    }
}
