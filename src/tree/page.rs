//! Per-node page layout: the fixed 32-byte header and the bounds-checked
//! accessors for branch and intermediate node bodies.
//!
//! Branch bodies are an array of `(key: i32, leaf_pid: u32, offset: u32)`
//! triples starting right after the header. Intermediate bodies store
//! `n - 1` keys after the header growing forward and `n` child pids packed
//! at the page tail growing backward (`child 0` occupies the last four
//! bytes). Leaf bodies are managed by [`crate::tree::leaf`].

use std::convert::TryInto;

use crate::error::{Result, StoreError};
use crate::types::PageId;

/// Size of the per-node header at offset 0 of every page except page 0.
pub const NODE_HDR_LEN: usize = 32;

const KIND_OFFSET: usize = 0;
const N_OFFSET: usize = 4;
const NUM_FREE_OFFSET: usize = 8;
const FREE_HEAD_OFFSET: usize = 12;
const NUM_FRAGMENTED_OFFSET: usize = 16;
const LEFT_SIB_OFFSET: usize = 20;
const RIGHT_SIB_OFFSET: usize = 24;
const NEXT_OVERFLOW_OFFSET: usize = 28;

/// Bytes per `(key, leaf_pid, record_offset)` branch triple.
pub const BRANCH_ENTRY_LEN: usize = 12;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Interior level above the branches: separator keys + child pids.
    Intermediate = 0,
    /// Penultimate level: triples pointing at records inside leaves.
    Branch = 1,
    /// Record heap with an intra-page free list.
    Leaf = 2,
}

impl NodeKind {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(NodeKind::Intermediate),
            1 => Ok(NodeKind::Branch),
            2 => Ok(NodeKind::Leaf),
            _ => Err(StoreError::Corruption("unknown node kind")),
        }
    }
}

/// Whether a node can take one more entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeFullStatus {
    NotFull,
    AtCapacity,
    PastCapacity,
    BytesFull,
}

/// Header metadata decoded from the first 32 bytes of a node page.
///
/// Field 4 (`free_head`) is kind-dependent: the free-list head offset for a
/// LEAF, the initial child pid for a BRANCH. The typed accessors check the
/// kind; the raw value is not exposed.
#[derive(Clone, Debug)]
pub struct NodeHeader {
    pub kind: NodeKind,
    pub n: u32,
    pub num_free: u32,
    free_head: u32,
    pub num_fragmented: u32,
    pub left_sibling: PageId,
    pub right_sibling: PageId,
    pub next_overflow: PageId,
}

impl NodeHeader {
    pub fn parse(page: &[u8]) -> Result<Self> {
        if page.len() < NODE_HDR_LEN {
            return Err(StoreError::Corruption("page shorter than node header"));
        }
        Ok(Self {
            kind: NodeKind::from_u32(read_u32(page, KIND_OFFSET))?,
            n: read_u32(page, N_OFFSET),
            num_free: read_u32(page, NUM_FREE_OFFSET),
            free_head: read_u32(page, FREE_HEAD_OFFSET),
            num_fragmented: read_u32(page, NUM_FRAGMENTED_OFFSET),
            left_sibling: PageId(read_u32(page, LEFT_SIB_OFFSET)),
            right_sibling: PageId(read_u32(page, RIGHT_SIB_OFFSET)),
            next_overflow: PageId(read_u32(page, NEXT_OVERFLOW_OFFSET)),
        })
    }

    /// Head of the intra-page free-block chain. LEAF only.
    pub fn free_list_head(&self) -> Result<u16> {
        if self.kind != NodeKind::Leaf {
            return Err(StoreError::Corruption("free list head on non-leaf"));
        }
        u16::try_from(self.free_head)
            .map_err(|_| StoreError::Corruption("free list head exceeds u16"))
    }

    /// The leaf this branch funnels records into. BRANCH only.
    pub fn initial_child(&self) -> Result<PageId> {
        if self.kind != NodeKind::Branch {
            return Err(StoreError::Corruption("initial child on non-branch"));
        }
        Ok(PageId(self.free_head))
    }
}

/// Zeroes the page and stamps the kind.
pub fn init_node(page: &mut [u8], kind: NodeKind) {
    page.fill(0);
    write_u32(page, KIND_OFFSET, kind as u32);
}

pub fn set_kind(page: &mut [u8], kind: NodeKind) {
    write_u32(page, KIND_OFFSET, kind as u32);
}

pub fn set_n(page: &mut [u8], n: u32) {
    write_u32(page, N_OFFSET, n);
}

pub fn set_num_free(page: &mut [u8], num_free: u32) {
    write_u32(page, NUM_FREE_OFFSET, num_free);
}

pub fn set_free_list_head(page: &mut [u8], head: u16) {
    write_u32(page, FREE_HEAD_OFFSET, u32::from(head));
}

pub fn set_initial_child(page: &mut [u8], pid: PageId) {
    write_u32(page, FREE_HEAD_OFFSET, pid.0);
}

pub fn set_num_fragmented(page: &mut [u8], value: u32) {
    write_u32(page, NUM_FRAGMENTED_OFFSET, value);
}

pub fn set_left_sibling(page: &mut [u8], pid: PageId) {
    write_u32(page, LEFT_SIB_OFFSET, pid.0);
}

pub fn set_right_sibling(page: &mut [u8], pid: PageId) {
    write_u32(page, RIGHT_SIB_OFFSET, pid.0);
}

pub fn set_next_overflow(page: &mut [u8], pid: PageId) {
    write_u32(page, NEXT_OVERFLOW_OFFSET, pid.0);
}

/// One `(key, leaf_pid, record_offset)` triple of a branch body.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BranchEntry {
    pub key: i32,
    pub leaf: PageId,
    pub offset: u32,
}

pub fn branch_entry(page: &[u8], idx: usize) -> Result<BranchEntry> {
    let start = NODE_HDR_LEN + idx * BRANCH_ENTRY_LEN;
    let end = start + BRANCH_ENTRY_LEN;
    if end > page.len() {
        return Err(StoreError::Corruption("branch entry beyond page"));
    }
    Ok(BranchEntry {
        key: read_i32(page, start),
        leaf: PageId(read_u32(page, start + 4)),
        offset: read_u32(page, start + 8),
    })
}

pub fn write_branch_entry(page: &mut [u8], idx: usize, entry: &BranchEntry) -> Result<()> {
    let start = NODE_HDR_LEN + idx * BRANCH_ENTRY_LEN;
    let end = start + BRANCH_ENTRY_LEN;
    if end > page.len() {
        return Err(StoreError::Corruption("branch entry beyond page"));
    }
    write_i32(page, start, entry.key);
    write_u32(page, start + 4, entry.leaf.0);
    write_u32(page, start + 8, entry.offset);
    Ok(())
}

pub fn zero_branch_entry(page: &mut [u8], idx: usize) -> Result<()> {
    let start = NODE_HDR_LEN + idx * BRANCH_ENTRY_LEN;
    let end = start + BRANCH_ENTRY_LEN;
    if end > page.len() {
        return Err(StoreError::Corruption("branch entry beyond page"));
    }
    page[start..end].fill(0);
    Ok(())
}

/// Separator key `idx` of an intermediate body (valid indices `0..n-1`).
pub fn intermediate_key(page: &[u8], idx: usize) -> Result<i32> {
    let start = NODE_HDR_LEN + idx * 4;
    if start + 4 > page.len() {
        return Err(StoreError::Corruption("separator key beyond page"));
    }
    Ok(read_i32(page, start))
}

pub fn set_intermediate_key(page: &mut [u8], idx: usize, key: i32) -> Result<()> {
    let start = NODE_HDR_LEN + idx * 4;
    if start + 4 > page.len() {
        return Err(StoreError::Corruption("separator key beyond page"));
    }
    write_i32(page, start, key);
    Ok(())
}

/// Child pid `idx` of an intermediate body. Pids pack backward from the page
/// tail: child 0 lives in the last four bytes.
pub fn child_at(page: &[u8], idx: usize) -> Result<PageId> {
    let start = child_offset(page.len(), idx)?;
    Ok(PageId(read_u32(page, start)))
}

pub fn set_child_at(page: &mut [u8], idx: usize, pid: PageId) -> Result<()> {
    let start = child_offset(page.len(), idx)?;
    write_u32(page, start, pid.0);
    Ok(())
}

fn child_offset(page_len: usize, idx: usize) -> Result<usize> {
    let back = (idx + 1) * 4;
    if back > page_len.saturating_sub(NODE_HDR_LEN) {
        return Err(StoreError::Corruption("child pid beyond page"));
    }
    Ok(page_len - back)
}

/// Capacity check for branch and intermediate nodes. Leaves are bounded by
/// their free list, not by `n`.
pub fn full_status(page: &[u8], branching_factor: u32) -> Result<NodeFullStatus> {
    let header = NodeHeader::parse(page)?;
    if header.n == branching_factor {
        return Ok(NodeFullStatus::AtCapacity);
    }
    if header.n > branching_factor {
        return Ok(NodeFullStatus::PastCapacity);
    }
    let (used, min_space) = match header.kind {
        NodeKind::Leaf => return Ok(NodeFullStatus::NotFull),
        NodeKind::Branch => (NODE_HDR_LEN + header.n as usize * BRANCH_ENTRY_LEN, 12),
        NodeKind::Intermediate => {
            let keys = header.n.saturating_sub(1) as usize * 4;
            let pids = header.n as usize * 4;
            (NODE_HDR_LEN + keys + pids, 8)
        }
    };
    if page.len().saturating_sub(used) < min_space {
        return Ok(NodeFullStatus::BytesFull);
    }
    Ok(NodeFullStatus::NotFull)
}

fn read_u32(page: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(page[offset..offset + 4].try_into().unwrap())
}

fn write_u32(page: &mut [u8], offset: usize, value: u32) {
    page[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_i32(page: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(page[offset..offset + 4].try_into().unwrap())
}

fn write_i32(page: &mut [u8], offset: usize, value: i32) {
    page[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() -> Result<()> {
        let mut page = vec![0u8; 128];
        init_node(&mut page, NodeKind::Leaf);
        set_n(&mut page, 3);
        set_num_free(&mut page, 1);
        set_free_list_head(&mut page, 44);
        set_num_fragmented(&mut page, 2);
        set_left_sibling(&mut page, PageId(7));
        set_right_sibling(&mut page, PageId(9));
        set_next_overflow(&mut page, PageId(11));

        let header = NodeHeader::parse(&page)?;
        assert_eq!(header.kind, NodeKind::Leaf);
        assert_eq!(header.n, 3);
        assert_eq!(header.num_free, 1);
        assert_eq!(header.free_list_head()?, 44);
        assert_eq!(header.num_fragmented, 2);
        assert_eq!(header.left_sibling, PageId(7));
        assert_eq!(header.right_sibling, PageId(9));
        assert_eq!(header.next_overflow, PageId(11));
        Ok(())
    }

    #[test]
    fn kind_checked_accessors_reject_wrong_kind() -> Result<()> {
        let mut page = vec![0u8; 128];
        init_node(&mut page, NodeKind::Branch);
        set_initial_child(&mut page, PageId(5));
        let header = NodeHeader::parse(&page)?;
        assert_eq!(header.initial_child()?, PageId(5));
        assert!(header.free_list_head().is_err());
        Ok(())
    }

    #[test]
    fn child_pids_pack_backward_from_tail() -> Result<()> {
        let mut page = vec![0u8; 128];
        init_node(&mut page, NodeKind::Intermediate);
        set_child_at(&mut page, 0, PageId(10))?;
        set_child_at(&mut page, 1, PageId(20))?;
        assert_eq!(child_at(&page, 0)?, PageId(10));
        assert_eq!(child_at(&page, 1)?, PageId(20));
        assert_eq!(&page[124..128], &10u32.to_le_bytes());
        assert_eq!(&page[120..124], &20u32.to_le_bytes());
        Ok(())
    }

    #[test]
    fn branch_entry_roundtrip_and_bounds() -> Result<()> {
        let mut page = vec![0u8; 128];
        init_node(&mut page, NodeKind::Branch);
        let entry = BranchEntry {
            key: -5,
            leaf: PageId(3),
            offset: 40,
        };
        write_branch_entry(&mut page, 2, &entry)?;
        assert_eq!(branch_entry(&page, 2)?, entry);
        assert!(branch_entry(&page, 8).is_err());
        Ok(())
    }

    #[test]
    fn full_status_tracks_capacity() -> Result<()> {
        let mut page = vec![0u8; 128];
        init_node(&mut page, NodeKind::Branch);
        set_n(&mut page, 3);
        assert_eq!(full_status(&page, 4)?, NodeFullStatus::NotFull);
        set_n(&mut page, 4);
        assert_eq!(full_status(&page, 4)?, NodeFullStatus::AtCapacity);
        set_n(&mut page, 5);
        assert_eq!(full_status(&page, 4)?, NodeFullStatus::PastCapacity);
        Ok(())
    }
}
