//! Leaf operations: the intra-page free-block allocator.
//!
//! A leaf is a record heap. Free space is chained through [`FreeBlock`]s in
//! ascending offset order starting at the node header's free-list head. When
//! a leaf (and its chain) has no block large enough, insertion continues on
//! an overflow leaf linked through `next_overflow`.

use tracing::debug;

use crate::alloc::PageAllocator;
use crate::error::{Result, StoreError};
use crate::tree::header::TreeHeader;
use crate::tree::page::{self, NodeHeader, NodeKind, NODE_HDR_LEN};
use crate::tree::record::{FreeBlock, NextPtr, Record, FREE_BLOCK_LEN};
use crate::types::PageId;

/// Where the link to a free block lives: the header's head field, or the
/// `next` field of the block at a given offset.
#[derive(Copy, Clone, Debug)]
enum LinkLoc {
    Head,
    Block(u16),
}

fn read_link(page: &[u8], loc: LinkLoc) -> Result<NextPtr> {
    match loc {
        LinkLoc::Head => {
            let head = NodeHeader::parse(page)?.free_list_head()?;
            NextPtr::decode(head, page.len())
        }
        LinkLoc::Block(offset) => Ok(FreeBlock::read_from(page, offset)?.next),
    }
}

fn write_link(page: &mut [u8], loc: LinkLoc, next: NextPtr) -> Result<()> {
    match loc {
        LinkLoc::Head => {
            page::set_free_list_head(page, next.encode());
            Ok(())
        }
        LinkLoc::Block(offset) => {
            let mut block = FreeBlock::read_from(page, offset)?;
            block.next = next;
            block.write_to(page, offset)
        }
    }
}

/// Initializes `pid` as an empty leaf: a single free block spans the whole
/// record area.
pub fn init(store: &mut PageAllocator, tree: &TreeHeader, pid: PageId) -> Result<()> {
    let page = store.page_mut(pid)?;
    page::init_node(page, NodeKind::Leaf);
    page::set_num_free(page, 1);
    let start = NODE_HDR_LEN as u16;
    page::set_free_list_head(page, start);
    let size = tree.page_size as u16 - start;
    FreeBlock {
        next: NextPtr::End,
        size,
    }
    .write_to(page, start)?;
    Ok(())
}

pub fn allocate(store: &mut PageAllocator, tree: &TreeHeader) -> Result<PageId> {
    let pid = store.allocate()?;
    init(store, tree, pid)?;
    Ok(pid)
}

/// Writes `record` into the first free block that fits, following the
/// overflow chain (and growing it) when this page is exhausted.
///
/// Returns the offset the record landed at and the page it landed on; the
/// owning branch stores both.
pub fn insert(
    store: &mut PageAllocator,
    tree: &TreeHeader,
    pid: PageId,
    record: &Record,
) -> Result<(u32, PageId)> {
    let footprint = record.footprint();
    if footprint > tree.leaf_capacity() {
        return Err(StoreError::Invalid("record larger than leaf capacity"));
    }
    let mut pid = pid;
    loop {
        let header = NodeHeader::parse(store.page(pid)?)?;
        if header.kind != NodeKind::Leaf {
            return Err(StoreError::Corruption("leaf insert into non-leaf"));
        }
        if let Some((link, offset)) = find_slot(store.page(pid)?, footprint)? {
            return place(store, pid, link, offset, record);
        }
        if header.next_overflow.is_none() {
            let overflow = allocate(store, tree)?;
            page::set_next_overflow(store.page_mut(pid)?, overflow);
            debug!(leaf = %pid, overflow = %overflow, "chained overflow leaf");
            pid = overflow;
        } else {
            pid = header.next_overflow;
        }
    }
}

/// First-fit walk of this page's chain.
fn find_slot(page: &[u8], footprint: usize) -> Result<Option<(LinkLoc, u16)>> {
    let mut link = LinkLoc::Head;
    let mut hops = 0;
    loop {
        match read_link(page, link)? {
            NextPtr::End => return Ok(None),
            NextPtr::InPage(offset) => {
                let block = FreeBlock::read_from(page, offset)?;
                if block.size as usize >= footprint {
                    return Ok(Some((link, offset)));
                }
                link = LinkLoc::Block(offset);
                hops += 1;
                if hops > page.len() / FREE_BLOCK_LEN {
                    return Err(StoreError::Corruption("free list cycle"));
                }
            }
        }
    }
}

fn place(
    store: &mut PageAllocator,
    pid: PageId,
    link: LinkLoc,
    offset: u16,
    record: &Record,
) -> Result<(u32, PageId)> {
    let page = store.page_mut(pid)?;
    let block = FreeBlock::read_from(page, offset)?;
    let footprint = record.footprint();
    record.write_to(page, offset as usize)?;

    let header = NodeHeader::parse(page)?;
    let residual = block.size as usize - footprint;
    if residual < FREE_BLOCK_LEN {
        // Too small to carry a block header: unlink and account the loss.
        write_link(page, link, block.next)?;
        page::set_num_fragmented(page, header.num_fragmented + residual as u32);
        let num_free = header
            .num_free
            .checked_sub(1)
            .ok_or(StoreError::Corruption("free count underflow"))?;
        page::set_num_free(page, num_free);
    } else {
        let new_offset = offset + footprint as u16;
        let mut total = residual as u16;
        let mut next = block.next;
        let mut merged = 0u32;
        // Coalesce forward while the successor sits flush against us.
        while let NextPtr::InPage(adjacent) = next {
            if new_offset + total != adjacent {
                break;
            }
            let neighbor = FreeBlock::read_from(page, adjacent)?;
            total += neighbor.size;
            next = neighbor.next;
            merged += 1;
        }
        FreeBlock { next, size: total }.write_to(page, new_offset)?;
        write_link(page, link, NextPtr::InPage(new_offset))?;
        if merged > 0 {
            let num_free = header
                .num_free
                .checked_sub(merged)
                .ok_or(StoreError::Corruption("free count underflow"))?;
            page::set_num_free(page, num_free);
        }
    }
    let header = NodeHeader::parse(page)?;
    page::set_n(page, header.n + 1);
    Ok((u32::from(offset), pid))
}

/// Removes the record at `offset`, splicing a free block into the
/// address-ordered chain and coalescing forward.
pub fn delete(store: &mut PageAllocator, pid: PageId, offset: u32) -> Result<()> {
    let page = store.page_mut(pid)?;
    let header = NodeHeader::parse(page)?;
    if header.kind != NodeKind::Leaf {
        return Err(StoreError::Corruption("leaf delete on non-leaf"));
    }
    if header.n == 0 {
        return Err(StoreError::Corruption("leaf delete on empty leaf"));
    }
    let offset = u16::try_from(offset)
        .map_err(|_| StoreError::Corruption("record offset exceeds u16"))?;
    if (offset as usize) < NODE_HDR_LEN {
        return Err(StoreError::Corruption("record offset inside header"));
    }
    let footprint = Record::footprint_at(page, offset as usize)?;
    let footprint = footprint as u16;
    page[offset as usize..(offset + footprint) as usize].fill(0);
    page::set_n(page, header.n - 1);

    let mut link = LinkLoc::Head;
    loop {
        match read_link(page, link)? {
            NextPtr::End => {
                FreeBlock {
                    next: NextPtr::End,
                    size: footprint,
                }
                .write_to(page, offset)?;
                write_link(page, link, NextPtr::InPage(offset))?;
                page::set_num_free(page, NodeHeader::parse(page)?.num_free + 1);
                return Ok(());
            }
            NextPtr::InPage(target) if target > offset => {
                let mut total = footprint;
                let mut next = NextPtr::InPage(target);
                let mut merged = 0u32;
                while let NextPtr::InPage(adjacent) = next {
                    if offset + total != adjacent {
                        break;
                    }
                    let neighbor = FreeBlock::read_from(page, adjacent)?;
                    total += neighbor.size;
                    next = neighbor.next;
                    merged += 1;
                }
                FreeBlock { next, size: total }.write_to(page, offset)?;
                write_link(page, link, NextPtr::InPage(offset))?;
                let num_free = NodeHeader::parse(page)?
                    .num_free
                    .checked_add(1)
                    .and_then(|v| v.checked_sub(merged))
                    .ok_or(StoreError::Corruption("free count underflow"))?;
                page::set_num_free(page, num_free);
                return Ok(());
            }
            NextPtr::InPage(target) => {
                if target == offset {
                    return Err(StoreError::Corruption("record offset already free"));
                }
                link = LinkLoc::Block(target);
            }
        }
    }
}

/// In-place overwrite for an update whose new record fits the old footprint.
/// Shrinkage is charged to the fragmentation counter so leaf accounting
/// stays exact.
pub fn overwrite(
    store: &mut PageAllocator,
    pid: PageId,
    offset: u32,
    record: &Record,
) -> Result<()> {
    let page = store.page_mut(pid)?;
    let header = NodeHeader::parse(page)?;
    if header.kind != NodeKind::Leaf {
        return Err(StoreError::Corruption("leaf overwrite on non-leaf"));
    }
    let offset = offset as usize;
    let old_footprint = Record::footprint_at(page, offset)?;
    let new_footprint = record.footprint();
    if new_footprint > old_footprint {
        return Err(StoreError::Invalid("record does not fit in place"));
    }
    record.write_to(page, offset)?;
    if new_footprint < old_footprint {
        page[offset + new_footprint..offset + old_footprint].fill(0);
        let slack = (old_footprint - new_footprint) as u32;
        page::set_num_fragmented(page, header.num_fragmented + slack);
    }
    Ok(())
}

/// Deallocates a leaf together with its whole overflow chain.
pub fn free_chain(store: &mut PageAllocator, pid: PageId) -> Result<()> {
    let mut pids = Vec::new();
    let mut cur = pid;
    while !cur.is_none() {
        let header = NodeHeader::parse(store.page(cur)?)?;
        if header.kind != NodeKind::Leaf {
            return Err(StoreError::Corruption("overflow chain leaves the leaf level"));
        }
        pids.push(cur);
        if pids.len() > store.max_pages() {
            return Err(StoreError::Corruption("overflow chain cycle"));
        }
        cur = header.next_overflow;
    }
    for pid in pids {
        store.free(pid)?;
    }
    Ok(())
}
