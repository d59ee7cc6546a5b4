//! Whole-tree invariant checks, used by the test suite after every batch of
//! operations.

use std::collections::HashMap;

use crate::error::{Result, StoreError};
use crate::tree::branch;
use crate::tree::page::{NodeHeader, NodeKind, NODE_HDR_LEN};
use crate::tree::record::{FreeBlock, NextPtr, Record};
use crate::tree::tree::BPTree;
use crate::types::{PageId, ROOT_PAGE_ID};

impl BPTree {
    /// Walks the whole tree and errors on the first structural invariant
    /// violation: kind placement, key ordering and range containment,
    /// branching-factor bounds, entry/record agreement, and exact leaf
    /// accounting.
    pub fn verify(&self) -> Result<()> {
        let root = NodeHeader::parse(self.store.page(ROOT_PAGE_ID)?)?;
        if root.kind == NodeKind::Leaf {
            return Err(StoreError::Corruption("root is a leaf"));
        }
        self.verify_node(ROOT_PAGE_ID, None, None)
    }

    fn verify_node(&self, pid: PageId, lo: Option<i32>, hi: Option<i32>) -> Result<()> {
        let page = self.store.page(pid)?;
        let header = NodeHeader::parse(page)?;
        if header.n > self.header.branching_factor {
            return Err(StoreError::Corruption("node exceeds the branching factor"));
        }
        match header.kind {
            NodeKind::Intermediate => {
                let (keys, pids) = branch::read_intermediate(page)?;
                check_sorted_in_range(&keys, lo, hi)?;
                for (idx, child) in pids.iter().enumerate() {
                    if child.is_none() {
                        return Err(StoreError::Corruption("intermediate has a null child"));
                    }
                    let child_lo = if idx == 0 { lo } else { Some(keys[idx - 1]) };
                    let child_hi = if idx == pids.len() - 1 {
                        hi
                    } else {
                        Some(keys[idx])
                    };
                    self.verify_node(*child, child_lo, child_hi)?;
                }
                Ok(())
            }
            NodeKind::Branch => self.verify_branch(pid, lo, hi),
            NodeKind::Leaf => Err(StoreError::Corruption("leaf reached by interior walk")),
        }
    }

    fn verify_branch(&self, pid: PageId, lo: Option<i32>, hi: Option<i32>) -> Result<()> {
        let page = self.store.page(pid)?;
        let header = NodeHeader::parse(page)?;
        let entries = branch::entries(page)?;
        let keys: Vec<i32> = entries.iter().map(|entry| entry.key).collect();
        check_sorted_in_range(&keys, lo, hi)?;

        // Every entry must point at a readable record on a page of this
        // branch's own leaf chain.
        let chain = self.leaf_chain(header.initial_child()?)?;
        let mut per_leaf: HashMap<PageId, Vec<u32>> = HashMap::new();
        for pid in &chain {
            per_leaf.insert(*pid, Vec::new());
        }
        for entry in &entries {
            let offsets = per_leaf
                .get_mut(&entry.leaf)
                .ok_or(StoreError::Corruption("entry points outside the leaf chain"))?;
            offsets.push(entry.offset);
            Record::read_from(self.store.page(entry.leaf)?, entry.offset as usize)?;
        }
        for (leaf, offsets) in &per_leaf {
            self.verify_leaf(*leaf, offsets)?;
        }
        Ok(())
    }

    fn leaf_chain(&self, head: PageId) -> Result<Vec<PageId>> {
        let mut chain = Vec::new();
        let mut cur = head;
        while !cur.is_none() {
            let header = NodeHeader::parse(self.store.page(cur)?)?;
            if header.kind != NodeKind::Leaf {
                return Err(StoreError::Corruption("leaf chain leaves the leaf level"));
            }
            chain.push(cur);
            if chain.len() > self.store.max_pages() {
                return Err(StoreError::Corruption("leaf chain cycle"));
            }
            cur = header.next_overflow;
        }
        Ok(chain)
    }

    /// Leaf accounting: `header + records + free blocks + fragmentation`
    /// must cover the page exactly, and the free chain must be address
    /// ordered with an accurate length counter.
    fn verify_leaf(&self, pid: PageId, offsets: &[u32]) -> Result<()> {
        let page = self.store.page(pid)?;
        let header = NodeHeader::parse(page)?;
        if header.n as usize != offsets.len() {
            return Err(StoreError::Corruption("leaf count disagrees with its branch"));
        }
        let mut record_bytes = 0usize;
        for &offset in offsets {
            record_bytes += Record::footprint_at(page, offset as usize)?;
        }
        let mut free_bytes = 0usize;
        let mut blocks = 0u32;
        let mut prev = 0u16;
        let mut cur = NextPtr::decode(header.free_list_head()?, page.len())?;
        while let NextPtr::InPage(offset) = cur {
            if offset <= prev {
                return Err(StoreError::Corruption("free chain is not address ordered"));
            }
            prev = offset;
            let block = FreeBlock::read_from(page, offset)?;
            free_bytes += block.size as usize;
            blocks += 1;
            if blocks as usize > page.len() {
                return Err(StoreError::Corruption("free chain cycle"));
            }
            cur = block.next;
        }
        if blocks != header.num_free {
            return Err(StoreError::Corruption("free chain length counter is wrong"));
        }
        let total = NODE_HDR_LEN + record_bytes + free_bytes + header.num_fragmented as usize;
        if total != page.len() {
            return Err(StoreError::Corruption("leaf accounting mismatch"));
        }
        Ok(())
    }
}

fn check_sorted_in_range(keys: &[i32], lo: Option<i32>, hi: Option<i32>) -> Result<()> {
    for window in keys.windows(2) {
        if window[0] >= window[1] {
            return Err(StoreError::Corruption("keys are not strictly ascending"));
        }
    }
    if let (Some(lo), Some(&first)) = (lo, keys.first()) {
        if first < lo {
            return Err(StoreError::Corruption("key below the subtree lower bound"));
        }
    }
    if let (Some(hi), Some(&last)) = (hi, keys.last()) {
        if last >= hi {
            return Err(StoreError::Corruption("key above the subtree upper bound"));
        }
    }
    Ok(())
}
