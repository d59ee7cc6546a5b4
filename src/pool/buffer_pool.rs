use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::Mutex;
use tracing::debug;

use super::frame::Frame;
use super::guard::{FrameLock, ReadPageGuard, WritePageGuard};
use crate::error::{Result, StoreError};
use crate::types::PageId;

/// How a caller intends to touch the page behind a guard.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AccessMode {
    Read,
    Write,
}

/// Access counters are kept modulo this; a cheap LRU-K stand-in.
const LRU_K: u8 = 2;

const BACKOFF_START: Duration = Duration::from_nanos(512);
const BACKOFF_MAX: Duration = Duration::from_millis(1);

struct PoolInner {
    free_frames: Vec<usize>,
    page_to_frame: HashMap<PageId, usize>,
    frame_to_page: HashMap<usize, PageId>,
    access_count: Vec<u8>,
    inflight: HashSet<PageId>,
}

/// Bounded cache of page frames over one database file.
///
/// All map state lives under a single pool mutex; per-frame reader/writer
/// locks linearize access to page contents. The pool mutex is never held
/// across disk I/O or while blocking on a frame lock.
///
/// Callers acquiring multiple guards must take them in increasing pid order
/// and release them in acquisition order; with three or more threads even
/// that can deadlock, so multi-guard callers are expected to release and
/// retry with backoff (see the concurrency tests).
pub struct BufferPool {
    file: Mutex<File>,
    page_size: usize,
    frames: Vec<Frame>,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Opens (creating if missing) the file at `path` and sizes the cache at
    /// `frame_count` frames of `page_size` bytes.
    pub fn new(path: impl AsRef<Path>, page_size: usize, frame_count: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(StoreError::Invalid("page size must be non-zero"));
        }
        if frame_count == 0 {
            return Err(StoreError::Invalid("frame count must be non-zero"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            frames.push(Frame::new(page_size));
        }
        let inner = PoolInner {
            free_frames: (0..frame_count).rev().collect(),
            page_to_frame: HashMap::new(),
            frame_to_page: HashMap::new(),
            access_count: vec![0; frame_count],
            inflight: HashSet::new(),
        };
        Ok(Self {
            file: Mutex::new(file),
            page_size,
            frames,
            inner: Mutex::new(inner),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Shared access to `pid`. Multiple read guards for one page may coexist.
    pub fn read_guard(&self, pid: PageId) -> Result<ReadPageGuard<'_>> {
        let lock = self.acquire(pid, AccessMode::Read)?;
        match lock {
            FrameLock::Read(lock) => Ok(ReadPageGuard::new(self, pid, lock)),
            FrameLock::Write(_) => Err(StoreError::Corruption("read acquire produced write lock")),
        }
    }

    /// Exclusive access to `pid`. The guard flushes the frame to disk when it
    /// is dropped, before the frame lock is released.
    pub fn write_guard(&self, pid: PageId) -> Result<WritePageGuard<'_>> {
        let lock = self.acquire(pid, AccessMode::Write)?;
        match lock {
            FrameLock::Write(lock) => Ok(WritePageGuard::new(self, pid, lock)),
            FrameLock::Read(_) => Err(StoreError::Corruption("write acquire produced read lock")),
        }
    }

    fn acquire(&self, pid: PageId, mode: AccessMode) -> Result<FrameLock> {
        let mut inner = self.inner.lock();
        loop {
            // In memory already: queue on the frame lock.
            if let Some(&frame_id) = inner.page_to_frame.get(&pid) {
                let frame = &self.frames[frame_id];
                frame.begin_wait(mode);
                drop(inner);
                let lock = match mode {
                    AccessMode::Read => FrameLock::Read(frame.buf.read_arc()),
                    AccessMode::Write => FrameLock::Write(frame.buf.write_arc()),
                };
                inner = self.inner.lock();
                frame.end_wait(mode);
                // The pending counter kept eviction away, so the mapping is
                // still ours.
                debug_assert_eq!(inner.page_to_frame.get(&pid), Some(&frame_id));
                inner.access_count[frame_id] = (inner.access_count[frame_id] + 1) % LRU_K;
                self.sanity_check(&inner);
                return Ok(lock);
            }

            // Someone else is already loading it; back off and retry so at
            // most one disk read per pid is in flight.
            if inner.inflight.contains(&pid) {
                let mut backoff = BACKOFF_START;
                loop {
                    drop(inner);
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    inner = self.inner.lock();
                    if !inner.inflight.contains(&pid) {
                        break;
                    }
                }
                continue;
            }

            // Miss: claim a frame and load from disk.
            let frame_id = match inner.free_frames.pop() {
                Some(frame_id) => frame_id,
                None => self.evict(&mut inner)?,
            };
            // The frame is unmapped, so nothing can contend for its lock.
            let mut lock = match self.frames[frame_id].buf.try_write_arc() {
                Some(lock) => lock,
                None => {
                    inner.free_frames.push(frame_id);
                    return Err(StoreError::Corruption("free frame is locked"));
                }
            };
            inner.inflight.insert(pid);
            drop(inner);

            let read_result = self.read_page_at(pid, &mut lock);
            inner = self.inner.lock();
            inner.inflight.remove(&pid);
            if let Err(err) = read_result {
                inner.free_frames.push(frame_id);
                return Err(err);
            }
            debug!(pid = %pid, frame = frame_id, "loaded page into frame");
            inner.page_to_frame.insert(pid, frame_id);
            inner.frame_to_page.insert(frame_id, pid);
            inner.access_count[frame_id] = (inner.access_count[frame_id] + 1) % LRU_K;
            self.sanity_check(&inner);
            let lock = match mode {
                AccessMode::Write => FrameLock::Write(lock),
                AccessMode::Read => FrameLock::Read(ArcRwLockWriteGuard::downgrade(lock)),
            };
            return Ok(lock);
        }
    }

    /// Frees the least-recently-used unpinned frame. Dirty contents were
    /// already flushed when their write guard dropped, so eviction only
    /// clears the mapping.
    fn evict(&self, inner: &mut PoolInner) -> Result<usize> {
        let mut candidates: BinaryHeap<Reverse<(u8, usize)>> = BinaryHeap::new();
        for (&frame_id, _pid) in &inner.frame_to_page {
            if self.frames[frame_id].is_pinned() {
                continue;
            }
            candidates.push(Reverse((inner.access_count[frame_id], frame_id)));
        }
        let Reverse((_count, frame_id)) = candidates.pop().ok_or(StoreError::PoolFull)?;
        let pid = inner
            .frame_to_page
            .remove(&frame_id)
            .ok_or(StoreError::Corruption("evicted frame has no page"))?;
        inner.page_to_frame.remove(&pid);
        inner.access_count[frame_id] = 0;
        debug!(pid = %pid, frame = frame_id, "evicted frame");
        Ok(frame_id)
    }

    fn read_page_at(&self, pid: PageId, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.page_offset(pid)))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        // Reading past the current end of file yields zeroes.
        buf[filled..].fill(0);
        Ok(())
    }

    pub(crate) fn write_page_at(&self, pid: PageId, bytes: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.page_offset(pid)))?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn page_offset(&self, pid: PageId) -> u64 {
        u64::from(pid.0) * self.page_size as u64
    }

    /// The page↔frame maps must stay a bijection; two frames claiming one
    /// page means a page was loaded twice.
    #[cfg(debug_assertions)]
    fn sanity_check(&self, inner: &PoolInner) {
        assert_eq!(
            inner.page_to_frame.len(),
            inner.frame_to_page.len(),
            "page/frame maps out of sync"
        );
        for (&pid, &frame_id) in &inner.page_to_frame {
            assert_eq!(
                inner.frame_to_page.get(&frame_id),
                Some(&pid),
                "page mapped to a frame that does not map back"
            );
        }
    }

    #[cfg(not(debug_assertions))]
    fn sanity_check(&self, _inner: &PoolInner) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(dir.path().join("basic.db"), 64, 4)?;

        let mut wpg = pool.write_guard(PageId(0))?;
        wpg.write(b"hello world", 0)?;
        wpg.release()?;

        let rpg = pool.read_guard(PageId(0))?;
        assert_eq!(&rpg.data()[..11], b"hello world");
        Ok(())
    }

    #[test]
    fn flush_on_drop_reaches_the_file() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flush.db");
        {
            let pool = BufferPool::new(&path, 16, 2)?;
            let mut wpg = pool.write_guard(PageId(3))?;
            wpg.write(b"abcd", 4)?;
        }
        let bytes = std::fs::read(&path)?;
        assert_eq!(bytes.len(), 16 * 4);
        assert_eq!(&bytes[3 * 16 + 4..3 * 16 + 8], b"abcd");
        Ok(())
    }

    #[test]
    fn eviction_recycles_frames() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(dir.path().join("evict.db"), 32, 2)?;
        for pid in 0..6u32 {
            let mut wpg = pool.write_guard(PageId(pid))?;
            wpg.write(&[pid as u8], 0)?;
        }
        for pid in 0..6u32 {
            let rpg = pool.read_guard(PageId(pid))?;
            assert_eq!(rpg.data()[0], pid as u8);
        }
        Ok(())
    }

    #[test]
    fn pool_full_when_every_frame_is_pinned() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(dir.path().join("full.db"), 32, 2)?;
        let _g0 = pool.read_guard(PageId(0))?;
        let _g1 = pool.read_guard(PageId(1))?;
        assert!(matches!(
            pool.read_guard(PageId(2)),
            Err(StoreError::PoolFull)
        ));
        Ok(())
    }

    #[test]
    fn oob_write_is_rejected() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(dir.path().join("oob.db"), 8, 1)?;
        let mut wpg = pool.write_guard(PageId(0))?;
        assert!(matches!(
            wpg.write(b"too long for page", 0),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(wpg.write(b"x", 8), Err(StoreError::Invalid(_))));
        Ok(())
    }
}
