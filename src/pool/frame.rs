use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::buffer_pool::AccessMode;

/// One buffer-pool cache slot.
///
/// The page bytes live behind an `Arc<RwLock<_>>` so a guard can keep the
/// frame locked after the pool mutex that produced it has been released. The
/// pending counters are bumped before a thread blocks on the frame lock;
/// eviction treats any frame with a non-zero counter as pinned.
pub struct Frame {
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pub pending_readers: AtomicU32,
    pub pending_writers: AtomicU32,
}

impl Frame {
    pub fn new(page_size: usize) -> Self {
        Self {
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            pending_readers: AtomicU32::new(0),
            pending_writers: AtomicU32::new(0),
        }
    }

    /// Announces that the calling thread is about to block on this frame's
    /// lock. Must be called while the pool mutex is held, so eviction cannot
    /// miss the pin.
    pub fn begin_wait(&self, mode: AccessMode) {
        match mode {
            AccessMode::Read => self.pending_readers.fetch_add(1, Ordering::AcqRel),
            AccessMode::Write => self.pending_writers.fetch_add(1, Ordering::AcqRel),
        };
    }

    pub fn end_wait(&self, mode: AccessMode) {
        match mode {
            AccessMode::Read => self.pending_readers.fetch_sub(1, Ordering::AcqRel),
            AccessMode::Write => self.pending_writers.fetch_sub(1, Ordering::AcqRel),
        };
    }

    /// Non-blocking test used by eviction: a frame is pinned while anyone
    /// holds its lock or is queued on it.
    pub fn is_pinned(&self) -> bool {
        if self.pending_readers.load(Ordering::Acquire) != 0
            || self.pending_writers.load(Ordering::Acquire) != 0
        {
            return true;
        }
        match self.buf.try_write() {
            Some(_guard) => false,
            None => true,
        }
    }
}
