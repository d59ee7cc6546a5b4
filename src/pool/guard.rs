use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;
use tracing::error;

use super::buffer_pool::BufferPool;
use crate::error::{Result, StoreError};
use crate::types::PageId;

pub(super) enum FrameLock {
    Read(ArcRwLockReadGuard<RawRwLock, Box<[u8]>>),
    Write(ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>),
}

/// Shared access to one cached page. The frame lock is released when the
/// guard is dropped; guards are move-only, so a released guard cannot be
/// touched again.
pub struct ReadPageGuard<'a> {
    _pool: &'a BufferPool,
    pid: PageId,
    lock: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
}

impl<'a> ReadPageGuard<'a> {
    pub(super) fn new(
        pool: &'a BufferPool,
        pid: PageId,
        lock: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
    ) -> Self {
        Self {
            _pool: pool,
            pid,
            lock,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.lock
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {}
}

/// Exclusive access to one cached page.
///
/// On every exit path (explicit [`release`](WritePageGuard::release), drop,
/// unwinding) the frame's bytes are flushed to disk at `pid × page_size`
/// before the frame lock is released. `release` surfaces the flush error;
/// `Drop` can only log it.
pub struct WritePageGuard<'a> {
    pool: &'a BufferPool,
    pid: PageId,
    lock: Option<ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>>,
}

impl<'a> WritePageGuard<'a> {
    pub(super) fn new(
        pool: &'a BufferPool,
        pid: PageId,
        lock: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    ) -> Self {
        Self {
            pool,
            pid,
            lock: Some(lock),
        }
    }

    pub fn data(&self) -> &[u8] {
        self.lock.as_deref().map(|b| &b[..]).unwrap_or(&[])
    }

    /// Copies `bytes` into the page at `offset`, bounds-checked against the
    /// page size.
    pub fn write(&mut self, bytes: &[u8], offset: usize) -> Result<()> {
        let buf = self
            .lock
            .as_deref_mut()
            .ok_or(StoreError::Corruption("write on released guard"))?;
        if offset >= buf.len() {
            return Err(StoreError::Invalid("write offset beyond page"));
        }
        let end = offset
            .checked_add(bytes.len())
            .ok_or(StoreError::Invalid("write length overflow"))?;
        if end > buf.len() {
            return Err(StoreError::Invalid("write runs past end of page"));
        }
        buf[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    /// Flushes and releases, surfacing any disk error.
    pub fn release(mut self) -> Result<()> {
        self.flush_and_unlock()
    }

    fn flush_and_unlock(&mut self) -> Result<()> {
        if let Some(lock) = self.lock.take() {
            let result = self.pool.write_page_at(self.pid, &lock);
            drop(lock);
            result
        } else {
            Ok(())
        }
    }
}

impl Drop for WritePageGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.flush_and_unlock() {
            error!(pid = %self.pid, %err, "failed to flush page on guard drop");
        }
    }
}
