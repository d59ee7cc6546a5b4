//! The B+Tree driver: root-anchored descent, split/merge propagation, and
//! the write-back coupling to the buffer pool.
//!
//! Node operations run on the pages owned by the [`PageAllocator`]. The
//! [`BufferPool`] mediates every byte of disk traffic: pages are loaded
//! through read guards on open and swept back through write guards (which
//! flush on drop) after every mutating operation, in ascending pid order.

use std::fs;
use std::io::Read;
use std::path::Path;

use smallvec::SmallVec;
use tracing::{debug, info};

use crate::alloc::PageAllocator;
use crate::error::{Result, StoreError};
use crate::pool::BufferPool;
use crate::tree::branch;
use crate::tree::header::{FieldKind, TreeHeader, MAX_TREE_PAGE_SIZE};
use crate::tree::leaf;
use crate::tree::page::{self, NodeFullStatus, NodeHeader, NodeKind};
use crate::tree::record::Record;
use crate::types::{PageId, HEADER_PAGE_ID, ROOT_PAGE_ID};

const DEFAULT_PAGE_SIZE: u32 = 4096;
const DEFAULT_BRANCHING_FACTOR: u32 = 64;
const DEFAULT_MAX_PAGES: usize = 10_000;
const DEFAULT_FRAME_COUNT: usize = 64;

/// Creation-time parameters for a tree file.
#[derive(Clone, Debug)]
pub struct TreeOptions {
    pub page_size: u32,
    pub branching_factor: u32,
    pub schema: Vec<FieldKind>,
    /// Upper bound on the page-id space.
    pub max_pages: usize,
    /// Buffer-pool frames backing the file.
    pub frame_count: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            branching_factor: DEFAULT_BRANCHING_FACTOR,
            schema: Vec::new(),
            max_pages: DEFAULT_MAX_PAGES,
            frame_count: DEFAULT_FRAME_COUNT,
        }
    }
}

/// A disk-backed B+Tree of `i32` keys and variable-length records.
///
/// Not reentrant across threads; the buffer pool underneath is.
pub struct BPTree {
    pub(crate) header: TreeHeader,
    pub(crate) store: PageAllocator,
    pool: BufferPool,
}

impl BPTree {
    /// Creates a fresh tree file at `path`: header in page 0, an empty
    /// BRANCH root in page 1.
    pub fn create(path: impl AsRef<Path>, options: TreeOptions) -> Result<Self> {
        let header = TreeHeader::new(
            options.page_size,
            options.branching_factor,
            options.schema,
        )?;
        let pool = BufferPool::new(
            path.as_ref(),
            options.page_size as usize,
            options.frame_count,
        )?;
        let mut store = PageAllocator::new(options.page_size as usize, options.max_pages)?;
        header.encode(store.page_mut(HEADER_PAGE_ID)?)?;
        page::init_node(store.page_mut(ROOT_PAGE_ID)?, NodeKind::Branch);
        let mut tree = Self {
            header,
            store,
            pool,
        };
        tree.flush()?;
        info!(
            path = %path.as_ref().display(),
            page_size = tree.header.page_size,
            branching_factor = tree.header.branching_factor,
            "created tree"
        );
        Ok(tree)
    }

    /// Opens an existing tree file, loading every page through the buffer
    /// pool and reclaiming unreferenced page ids.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let page_size = bootstrap_page_size(path)?;
        let file_len = fs::metadata(path)?.len();
        if file_len % u64::from(page_size) != 0 {
            return Err(StoreError::Corruption("file length is not page aligned"));
        }
        let num_pages = (file_len / u64::from(page_size)) as usize;
        if num_pages < 2 {
            return Err(StoreError::Corruption("tree file missing header or root"));
        }
        let pool = BufferPool::new(path, page_size as usize, DEFAULT_FRAME_COUNT)?;
        let mut store =
            PageAllocator::new(page_size as usize, DEFAULT_MAX_PAGES.max(num_pages))?;
        for pid in 0..num_pages as u32 {
            let guard = pool.read_guard(PageId(pid))?;
            store.install(PageId(pid), guard.data())?;
        }
        let header = TreeHeader::decode(store.page(HEADER_PAGE_ID)?)?;
        if header.page_size != page_size {
            return Err(StoreError::Corruption("header page size mismatch"));
        }
        let mut tree = Self {
            header,
            store,
            pool,
        };
        tree.mark_reachable()?;
        info!(path = %path.display(), pages = num_pages, "opened tree");
        Ok(tree)
    }

    pub fn header(&self) -> &TreeHeader {
        &self.header
    }

    /// Number of levels from the root down to the leaves.
    pub fn depth(&self) -> Result<usize> {
        let mut levels = 1;
        let mut x = ROOT_PAGE_ID;
        loop {
            let header = NodeHeader::parse(self.store.page(x)?)?;
            match header.kind {
                NodeKind::Branch => {
                    if header.n == 0 && header.initial_child()?.is_none() {
                        return Ok(levels);
                    }
                    return Ok(levels + 1);
                }
                NodeKind::Intermediate => {
                    levels += 1;
                    x = page::child_at(self.store.page(x)?, 0)?;
                }
                NodeKind::Leaf => {
                    return Err(StoreError::Corruption("descent reached a leaf"))
                }
            }
        }
    }

    /// Inserts a new key. An existing key is a [`StoreError::DuplicateKey`].
    pub fn insert(&mut self, key: i32, record: &Record) -> Result<()> {
        let result = self.insert_inner(key, record);
        // Structural changes (splits) may precede a semantic error; they go
        // to disk either way.
        self.flush()?;
        result
    }

    fn insert_inner(&mut self, key: i32, record: &Record) -> Result<()> {
        let mut path: SmallVec<[PageId; 8]> = SmallVec::new();
        let mut x = ROOT_PAGE_ID;
        loop {
            let status =
                page::full_status(self.store.page(x)?, self.header.branching_factor)?;
            if status != NodeFullStatus::NotFull {
                self.split_node(x, &path)?;
                // The key may now belong in the freshly split-off sibling;
                // re-run from the parent, which has both.
                if let Some(parent) = path.pop() {
                    x = parent;
                }
                continue;
            }
            let header = NodeHeader::parse(self.store.page(x)?)?;
            match header.kind {
                NodeKind::Branch => {
                    branch::insert(&mut self.store, &self.header, x, key, record)?;
                    break;
                }
                NodeKind::Intermediate => {
                    let idx = self.pick_child(x, key)?;
                    let child = page::child_at(self.store.page(x)?, idx)?;
                    if child.is_none() {
                        return Err(StoreError::Corruption("intermediate has a null child"));
                    }
                    path.push(x);
                    x = child;
                }
                NodeKind::Leaf => {
                    return Err(StoreError::Corruption("descent reached a leaf"))
                }
            }
        }
        Ok(())
    }

    /// Replaces the record stored under `key`.
    pub fn update(&mut self, key: i32, record: &Record) -> Result<()> {
        let result = self.update_inner(key, record);
        self.flush()?;
        result
    }

    fn update_inner(&mut self, key: i32, record: &Record) -> Result<()> {
        let mut x = ROOT_PAGE_ID;
        loop {
            let header = NodeHeader::parse(self.store.page(x)?)?;
            match header.kind {
                NodeKind::Branch => {
                    branch::update(&mut self.store, &self.header, x, key, record)?;
                    break;
                }
                NodeKind::Intermediate => {
                    let idx = self.pick_child(x, key)?;
                    x = page::child_at(self.store.page(x)?, idx)?;
                }
                NodeKind::Leaf => {
                    return Err(StoreError::Corruption("descent reached a leaf"))
                }
            }
        }
        Ok(())
    }

    /// Deletes `key`, repairing underflowing nodes on the way down.
    pub fn delete(&mut self, key: i32) -> Result<()> {
        let result = self.delete_inner(key);
        self.flush()?;
        result
    }

    fn delete_inner(&mut self, key: i32) -> Result<()> {
        let mut path: SmallVec<[(PageId, usize); 8]> = SmallVec::new();
        let mut x = ROOT_PAGE_ID;
        let mut self_idx = 0usize;
        loop {
            let header = NodeHeader::parse(self.store.page(x)?)?;
            if x == ROOT_PAGE_ID && header.kind == NodeKind::Intermediate && header.n == 1 {
                self.collapse_root()?;
                continue;
            }
            if x != ROOT_PAGE_ID && header.n < self.header.min_occupancy() {
                let (parent, _) = *path.last().ok_or(StoreError::Corruption(
                    "underflowing node has no parent on the path",
                ))?;
                let repaired = match header.kind {
                    NodeKind::Branch => {
                        branch::redistribute(
                            &mut self.store,
                            &self.header,
                            x,
                            parent,
                            self_idx,
                        )? || branch::merge(
                            &mut self.store,
                            &self.header,
                            x,
                            parent,
                            self_idx,
                        )?
                    }
                    NodeKind::Intermediate => {
                        branch::intermediate_redistribute(
                            &mut self.store,
                            &self.header,
                            x,
                            parent,
                            self_idx,
                        )? || branch::intermediate_merge(
                            &mut self.store,
                            &self.header,
                            x,
                            parent,
                            self_idx,
                        )?
                    }
                    NodeKind::Leaf => {
                        return Err(StoreError::Corruption("descent reached a leaf"))
                    }
                };
                if !repaired {
                    return Err(StoreError::Corruption(
                        "underflowing node has no viable sibling",
                    ));
                }
                let (parent, parent_idx) = path.pop().ok_or(StoreError::Corruption(
                    "underflowing node has no parent on the path",
                ))?;
                x = parent;
                self_idx = parent_idx;
                continue;
            }
            match header.kind {
                NodeKind::Branch => {
                    branch::delete(&mut self.store, x, key)?;
                    break;
                }
                NodeKind::Intermediate => {
                    let idx = self.pick_child(x, key)?;
                    let child = page::child_at(self.store.page(x)?, idx)?;
                    path.push((x, self_idx));
                    self_idx = idx;
                    x = child;
                }
                NodeKind::Leaf => {
                    return Err(StoreError::Corruption("descent reached a leaf"))
                }
            }
        }
        Ok(())
    }

    /// Point lookup. Touches no disk; the whole tree is resident.
    pub fn search(&self, key: i32) -> Result<Option<Record>> {
        let mut x = ROOT_PAGE_ID;
        loop {
            let header = NodeHeader::parse(self.store.page(x)?)?;
            if header.n == 0 {
                return Ok(None);
            }
            match header.kind {
                NodeKind::Branch => {
                    let Some((_, entry)) = branch::find_entry(self.store.page(x)?, key)?
                    else {
                        return Ok(None);
                    };
                    let leaf_page = self.store.page(entry.leaf)?;
                    if NodeHeader::parse(leaf_page)?.kind != NodeKind::Leaf {
                        return Err(StoreError::Corruption("branch entry points off-leaf"));
                    }
                    return Ok(Some(Record::read_from(leaf_page, entry.offset as usize)?));
                }
                NodeKind::Intermediate => {
                    let idx = self.pick_child(x, key)?;
                    x = page::child_at(self.store.page(x)?, idx)?;
                }
                NodeKind::Leaf => {
                    return Err(StoreError::Corruption("descent reached a leaf"))
                }
            }
        }
    }

    /// Child index for `key`: the largest `i` with `key >= keys[i]`, else 0.
    fn pick_child(&self, pid: PageId, key: i32) -> Result<usize> {
        let page = self.store.page(pid)?;
        let header = NodeHeader::parse(page)?;
        let n = header.n as usize;
        if n == 0 {
            return Err(StoreError::Corruption("descent through empty intermediate"));
        }
        let mut idx = 0;
        while idx < n - 1 {
            if key < page::intermediate_key(page, idx)? {
                break;
            }
            idx += 1;
        }
        Ok(idx)
    }

    fn split_node(&mut self, pid: PageId, path: &[PageId]) -> Result<()> {
        if pid == ROOT_PAGE_ID {
            return self.split_root();
        }
        let parent = *path.last().ok_or(StoreError::Corruption(
            "non-root split without a parent on the path",
        ))?;
        match page::full_status(self.store.page(parent)?, self.header.branching_factor)? {
            NodeFullStatus::NotFull | NodeFullStatus::AtCapacity => {}
            _ => return Err(StoreError::Corruption("split under an over-full parent")),
        }
        let kind = NodeHeader::parse(self.store.page(pid)?)?.kind;
        match kind {
            NodeKind::Intermediate => self.split_intermediate(pid, parent),
            NodeKind::Branch => self.split_branch(pid, parent),
            NodeKind::Leaf => Err(StoreError::Corruption("split of a leaf node")),
        }
    }

    fn split_root(&mut self) -> Result<()> {
        match NodeHeader::parse(self.store.page(ROOT_PAGE_ID)?)?.kind {
            NodeKind::Intermediate => self.split_root_intermediate(),
            NodeKind::Branch => self.split_root_branch(),
            NodeKind::Leaf => Err(StoreError::Corruption("root is a leaf")),
        }
    }

    /// Bisects the root's triples into two fresh branches (each re-homing
    /// its records into a fresh leaf), then rewrites page 1 as a two-child
    /// intermediate. The old leaf chain is deallocated wholesale.
    fn split_root_branch(&mut self) -> Result<()> {
        let entries = branch::entries(self.store.page(ROOT_PAGE_ID)?)?;
        let n = entries.len();
        if n < 2 {
            return Err(StoreError::Corruption("splitting a near-empty root"));
        }
        let mid = n / 2;
        let old_leaf = NodeHeader::parse(self.store.page(ROOT_PAGE_ID)?)?.initial_child()?;

        let left = self.store.allocate()?;
        branch::init(&mut self.store, left)?;
        let right = self.store.allocate()?;
        branch::init(&mut self.store, right)?;
        for entry in &entries[..mid] {
            let record =
                Record::read_from(self.store.page(entry.leaf)?, entry.offset as usize)?;
            branch::insert(&mut self.store, &self.header, left, entry.key, &record)?;
        }
        for entry in &entries[mid..] {
            let record =
                Record::read_from(self.store.page(entry.leaf)?, entry.offset as usize)?;
            branch::insert(&mut self.store, &self.header, right, entry.key, &record)?;
        }
        if !old_leaf.is_none() {
            leaf::free_chain(&mut self.store, old_leaf)?;
        }
        branch::link_after_split(&mut self.store, left, right)?;

        let promoted = entries[mid].key;
        let root = self.store.page_mut(ROOT_PAGE_ID)?;
        page::init_node(root, NodeKind::Intermediate);
        branch::write_intermediate(root, &[promoted], &[left, right])?;
        debug!(left = %left, right = %right, promoted, "split branch root");
        Ok(())
    }

    /// Bisects the root's separators and children into two fresh
    /// intermediates; the promoted separator is the right partition's
    /// minimum.
    fn split_root_intermediate(&mut self) -> Result<()> {
        let (keys, pids) = branch::read_intermediate(self.store.page(ROOT_PAGE_ID)?)?;
        let n = pids.len();
        if n < 2 {
            return Err(StoreError::Corruption("splitting an undersized root"));
        }
        let mid = n / 2;

        let left = self.store.allocate()?;
        {
            let page = self.store.page_mut(left)?;
            page::init_node(page, NodeKind::Intermediate);
            branch::write_intermediate(page, &keys[..mid - 1], &pids[..mid])?;
        }
        let right = self.store.allocate()?;
        {
            let page = self.store.page_mut(right)?;
            page::init_node(page, NodeKind::Intermediate);
            branch::write_intermediate(page, &keys[mid..], &pids[mid..])?;
        }
        branch::link_after_split(&mut self.store, left, right)?;

        let promoted = keys[mid - 1];
        let root = self.store.page_mut(ROOT_PAGE_ID)?;
        page::init_node(root, NodeKind::Intermediate);
        branch::write_intermediate(root, &[promoted], &[left, right])?;
        debug!(left = %left, right = %right, promoted, "split intermediate root");
        Ok(())
    }

    /// Moves the right half of a full branch into a fresh sibling (records
    /// re-homed into the sibling's own leaf) and pushes one separator up.
    fn split_branch(&mut self, pid: PageId, parent: PageId) -> Result<()> {
        let entries = branch::entries(self.store.page(pid)?)?;
        let n = entries.len();
        if n < 2 {
            return Err(StoreError::Corruption("splitting a near-empty branch"));
        }
        let mid = n / 2;

        let other = self.store.allocate()?;
        branch::init(&mut self.store, other)?;
        for entry in &entries[mid..] {
            let record =
                Record::read_from(self.store.page(entry.leaf)?, entry.offset as usize)?;
            branch::insert(&mut self.store, &self.header, other, entry.key, &record)?;
        }
        for entry in &entries[mid..] {
            leaf::delete(&mut self.store, entry.leaf, entry.offset)?;
        }
        branch::write_entries(self.store.page_mut(pid)?, &entries[..mid])?;

        let promoted = entries[mid].key;
        branch::intermediate_insert(&mut self.store, parent, promoted, other)?;
        branch::link_after_split(&mut self.store, pid, other)?;
        debug!(branch = %pid, sibling = %other, promoted, "split branch");
        Ok(())
    }

    /// Moves the right half of a full intermediate into a fresh sibling and
    /// pushes the partition separator up.
    fn split_intermediate(&mut self, pid: PageId, parent: PageId) -> Result<()> {
        let (keys, pids) = branch::read_intermediate(self.store.page(pid)?)?;
        let n = pids.len();
        if n < 2 {
            return Err(StoreError::Corruption("splitting an undersized intermediate"));
        }
        let mid = n / 2;

        let other = self.store.allocate()?;
        {
            let page = self.store.page_mut(other)?;
            page::init_node(page, NodeKind::Intermediate);
            branch::write_intermediate(page, &keys[mid..], &pids[mid..])?;
        }
        branch::write_intermediate(
            self.store.page_mut(pid)?,
            &keys[..mid - 1],
            &pids[..mid],
        )?;

        let promoted = keys[mid - 1];
        branch::intermediate_insert(&mut self.store, parent, promoted, other)?;
        branch::link_after_split(&mut self.store, pid, other)?;
        debug!(node = %pid, sibling = %other, promoted, "split intermediate");
        Ok(())
    }

    /// Adopts the content of an intermediate root's only child into page 1.
    /// The root's id never changes.
    fn collapse_root(&mut self) -> Result<()> {
        let child = page::child_at(self.store.page(ROOT_PAGE_ID)?, 0)?;
        let image = self.store.page(child)?.to_vec();
        let root = self.store.page_mut(ROOT_PAGE_ID)?;
        root.copy_from_slice(&image);
        page::set_left_sibling(root, PageId::NONE);
        page::set_right_sibling(root, PageId::NONE);
        self.store.free(child)?;
        debug!(child = %child, "collapsed root level");
        Ok(())
    }

    /// Sweeps dirty pages back to disk through pool write guards, in
    /// ascending pid order, one guard at a time.
    fn flush(&mut self) -> Result<()> {
        for pid in self.store.take_dirty() {
            let mut guard = self.pool.write_guard(pid)?;
            guard.write(self.store.page(pid)?, 0)?;
            guard.release()?;
        }
        Ok(())
    }

    /// Marks every page reachable from the root as in-use; everything else
    /// stays allocatable.
    fn mark_reachable(&mut self) -> Result<()> {
        let mut queue = vec![ROOT_PAGE_ID];
        let mut visited = std::collections::HashSet::new();
        while let Some(pid) = queue.pop() {
            if !visited.insert(pid) {
                return Err(StoreError::Corruption("page reachable twice"));
            }
            self.store.mark_in_use(pid)?;
            let header = NodeHeader::parse(self.store.page(pid)?)?;
            match header.kind {
                NodeKind::Intermediate => {
                    for idx in 0..header.n as usize {
                        queue.push(page::child_at(self.store.page(pid)?, idx)?);
                    }
                }
                NodeKind::Branch => {
                    let owned = header.initial_child()?;
                    if !owned.is_none() {
                        queue.push(owned);
                    }
                }
                NodeKind::Leaf => {
                    if !header.next_overflow.is_none() {
                        queue.push(header.next_overflow);
                    }
                }
            }
        }
        Ok(())
    }
}

fn bootstrap_page_size(path: &Path) -> Result<u32> {
    let mut file = fs::File::open(path)?;
    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes)?;
    let page_size = u32::from_le_bytes(bytes);
    if page_size == 0 || page_size % 32 != 0 || page_size > MAX_TREE_PAGE_SIZE {
        return Err(StoreError::Corruption("implausible page size in header"));
    }
    Ok(page_size)
}
