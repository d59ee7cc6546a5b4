//! Branch and intermediate node operations.
//!
//! A branch stores `(key, leaf_pid, record_offset)` triples sorted by key and
//! funnels record bytes into the one leaf chain it owns. An intermediate
//! stores separator keys and child pids. Structural edits decode the body
//! into vectors, operate, and write back; node bodies are small (`n ≤ B`).

use tracing::debug;

use crate::alloc::PageAllocator;
use crate::error::{Result, StoreError};
use crate::tree::header::TreeHeader;
use crate::tree::leaf;
use crate::tree::page::{
    self, BranchEntry, NodeFullStatus, NodeHeader, NodeKind,
};
use crate::tree::record::Record;
use crate::types::PageId;

pub fn init(store: &mut PageAllocator, pid: PageId) -> Result<()> {
    let page = store.page_mut(pid)?;
    page::init_node(page, NodeKind::Branch);
    Ok(())
}

/// Linear scan for an exact key match.
pub fn find_entry(page: &[u8], key: i32) -> Result<Option<(usize, BranchEntry)>> {
    let header = NodeHeader::parse(page)?;
    if header.kind != NodeKind::Branch {
        return Err(StoreError::Corruption("entry scan on non-branch"));
    }
    for idx in 0..header.n as usize {
        let entry = page::branch_entry(page, idx)?;
        if entry.key == key {
            return Ok(Some((idx, entry)));
        }
    }
    Ok(None)
}

pub fn entries(page: &[u8]) -> Result<Vec<BranchEntry>> {
    let header = NodeHeader::parse(page)?;
    if header.kind != NodeKind::Branch {
        return Err(StoreError::Corruption("entry read on non-branch"));
    }
    (0..header.n as usize)
        .map(|idx| page::branch_entry(page, idx))
        .collect()
}

/// Rewrites the whole triple array and `n`, zeroing any trailing slots the
/// node previously used.
pub fn write_entries(page: &mut [u8], entries: &[BranchEntry]) -> Result<()> {
    let old_n = NodeHeader::parse(page)?.n as usize;
    for (idx, entry) in entries.iter().enumerate() {
        page::write_branch_entry(page, idx, entry)?;
    }
    for idx in entries.len()..old_n {
        page::zero_branch_entry(page, idx)?;
    }
    page::set_n(page, entries.len() as u32);
    Ok(())
}

/// Inserts `(key, record)` through this branch: the record bytes go into the
/// branch's own leaf chain, the triple into the sorted array.
pub fn insert(
    store: &mut PageAllocator,
    tree: &TreeHeader,
    pid: PageId,
    key: i32,
    record: &Record,
) -> Result<()> {
    if record.footprint() > tree.leaf_capacity() {
        return Err(StoreError::Invalid("record larger than leaf capacity"));
    }
    let header = NodeHeader::parse(store.page(pid)?)?;
    if header.kind != NodeKind::Branch {
        return Err(StoreError::Corruption("insert into non-branch"));
    }
    match page::full_status(store.page(pid)?, tree.branching_factor)? {
        NodeFullStatus::PastCapacity => {
            return Err(StoreError::Corruption("insert into branch past capacity"))
        }
        NodeFullStatus::BytesFull => {
            return Err(StoreError::Corruption("branch has no bytes for a triple"))
        }
        NodeFullStatus::NotFull | NodeFullStatus::AtCapacity => {}
    }
    if find_entry(store.page(pid)?, key)?.is_some() {
        return Err(StoreError::DuplicateKey(key));
    }

    // Resolve the leaf this branch funnels records into; an empty branch
    // reuses a leaf it may still own, else allocates its first one.
    let target = header.initial_child()?;
    let target = if target.is_none() {
        if header.n != 0 {
            return Err(StoreError::Corruption("populated branch without a leaf"));
        }
        let fresh = leaf::allocate(store, tree)?;
        page::set_initial_child(store.page_mut(pid)?, fresh);
        fresh
    } else {
        target
    };

    let (offset, placed) = leaf::insert(store, tree, target, record)?;

    let page = store.page_mut(pid)?;
    let mut all = entries(page)?;
    let pos = all
        .iter()
        .position(|entry| entry.key > key)
        .unwrap_or(all.len());
    all.insert(
        pos,
        BranchEntry {
            key,
            leaf: placed,
            offset,
        },
    );
    write_entries(page, &all)
}

/// Overwrites in place when the new record fits the old footprint; otherwise
/// deletes and re-inserts, which may move the record to another page of the
/// leaf chain.
pub fn update(
    store: &mut PageAllocator,
    tree: &TreeHeader,
    pid: PageId,
    key: i32,
    record: &Record,
) -> Result<()> {
    if record.footprint() > tree.leaf_capacity() {
        return Err(StoreError::Invalid("record larger than leaf capacity"));
    }
    let (_, entry) = find_entry(store.page(pid)?, key)?.ok_or(StoreError::KeyNotFound(key))?;
    let old_footprint = Record::footprint_at(store.page(entry.leaf)?, entry.offset as usize)?;
    if record.footprint() <= old_footprint {
        leaf::overwrite(store, entry.leaf, entry.offset, record)
    } else {
        delete(store, pid, key)?;
        insert(store, tree, pid, key, record)
    }
}

/// Removes the triple for `key` and the record bytes it points at.
pub fn delete(store: &mut PageAllocator, pid: PageId, key: i32) -> Result<()> {
    let (idx, entry) = find_entry(store.page(pid)?, key)?.ok_or(StoreError::KeyNotFound(key))?;
    let page = store.page_mut(pid)?;
    let mut all = entries(page)?;
    all.remove(idx);
    write_entries(page, &all)?;
    leaf::delete(store, entry.leaf, entry.offset)
}

/// Deallocates a branch together with the leaf chain it owns.
pub fn free_node(store: &mut PageAllocator, pid: PageId) -> Result<()> {
    let header = NodeHeader::parse(store.page(pid)?)?;
    if header.kind != NodeKind::Branch {
        return Err(StoreError::Corruption("branch free on non-branch"));
    }
    let owned = header.initial_child()?;
    if !owned.is_none() {
        leaf::free_chain(store, owned)?;
    }
    store.free(pid)
}

/// Pulls every entry of an underflowing branch into a sibling that has room,
/// fixes the parent separators, and deallocates the branch with its leaves.
pub fn merge(
    store: &mut PageAllocator,
    tree: &TreeHeader,
    pid: PageId,
    parent: PageId,
    self_idx: usize,
) -> Result<bool> {
    let n = NodeHeader::parse(store.page(pid)?)?.n;
    for (sib_idx, merged_left) in sibling_candidates(store, parent, self_idx)? {
        let sib = page::child_at(store.page(parent)?, sib_idx)?;
        let sib_header = NodeHeader::parse(store.page(sib)?)?;
        if sib_header.kind != NodeKind::Branch {
            return Err(StoreError::Corruption("branch sibling is not a branch"));
        }
        if n + sib_header.n > tree.branching_factor {
            continue;
        }
        for entry in entries(store.page(pid)?)? {
            let record = Record::read_from(store.page(entry.leaf)?, entry.offset as usize)?;
            insert(store, tree, sib, entry.key, &record)?;
        }
        let key_idx = if merged_left { self_idx - 1 } else { self_idx };
        intermediate_remove_child(store, parent, self_idx, key_idx)?;
        unlink_siblings(store, pid)?;
        free_node(store, pid)?;
        debug!(branch = %pid, into = %sib, "merged branch into sibling");
        return Ok(true);
    }
    Ok(false)
}

/// Moves extremal entries from a richer sibling until this branch reaches
/// minimum occupancy, then rewrites the parent separator between the two.
pub fn redistribute(
    store: &mut PageAllocator,
    tree: &TreeHeader,
    pid: PageId,
    parent: PageId,
    self_idx: usize,
) -> Result<bool> {
    let min = tree.min_occupancy();
    for (sib_idx, from_left) in sibling_candidates(store, parent, self_idx)? {
        let sib = page::child_at(store.page(parent)?, sib_idx)?;
        let sib_header = NodeHeader::parse(store.page(sib)?)?;
        if sib_header.kind != NodeKind::Branch {
            return Err(StoreError::Corruption("branch sibling is not a branch"));
        }
        if sib_header.n <= min {
            continue;
        }
        loop {
            let self_n = NodeHeader::parse(store.page(pid)?)?.n;
            let sib_n = NodeHeader::parse(store.page(sib)?)?.n;
            if self_n >= min || sib_n <= min {
                break;
            }
            let donor_idx = if from_left { sib_n as usize - 1 } else { 0 };
            let entry = page::branch_entry(store.page(sib)?, donor_idx)?;
            let record = Record::read_from(store.page(entry.leaf)?, entry.offset as usize)?;
            delete(store, sib, entry.key)?;
            insert(store, tree, pid, entry.key, &record)?;
        }
        // The separator between donor and receiver is the minimum of
        // whichever of the two now starts the right-hand range.
        if from_left {
            let new_min = page::branch_entry(store.page(pid)?, 0)?.key;
            page::set_intermediate_key(store.page_mut(parent)?, self_idx - 1, new_min)?;
        } else {
            let new_min = page::branch_entry(store.page(sib)?, 0)?.key;
            page::set_intermediate_key(store.page_mut(parent)?, self_idx, new_min)?;
        }
        debug!(branch = %pid, from = %sib, "redistributed branch entries");
        return Ok(true);
    }
    Ok(false)
}

/// Left sibling first, then right, both confined to the same parent.
fn sibling_candidates(
    store: &PageAllocator,
    parent: PageId,
    self_idx: usize,
) -> Result<Vec<(usize, bool)>> {
    let header = NodeHeader::parse(store.page(parent)?)?;
    if header.kind != NodeKind::Intermediate {
        return Err(StoreError::Corruption("parent is not an intermediate"));
    }
    let mut candidates = Vec::with_capacity(2);
    if self_idx > 0 {
        candidates.push((self_idx - 1, true));
    }
    if self_idx + 1 < header.n as usize {
        candidates.push((self_idx + 1, false));
    }
    Ok(candidates)
}

/// Splices a node out of its level's doubly-linked sibling list.
pub fn unlink_siblings(store: &mut PageAllocator, pid: PageId) -> Result<()> {
    let header = NodeHeader::parse(store.page(pid)?)?;
    if !header.left_sibling.is_none() {
        page::set_right_sibling(store.page_mut(header.left_sibling)?, header.right_sibling);
    }
    if !header.right_sibling.is_none() {
        page::set_left_sibling(store.page_mut(header.right_sibling)?, header.left_sibling);
    }
    let page = store.page_mut(pid)?;
    page::set_left_sibling(page, PageId::NONE);
    page::set_right_sibling(page, PageId::NONE);
    Ok(())
}

/// Threads `right` into the level list immediately after `left`.
pub fn link_after_split(store: &mut PageAllocator, left: PageId, right: PageId) -> Result<()> {
    let old_right = NodeHeader::parse(store.page(left)?)?.right_sibling;
    {
        let page = store.page_mut(right)?;
        page::set_left_sibling(page, left);
        page::set_right_sibling(page, old_right);
    }
    page::set_right_sibling(store.page_mut(left)?, right);
    if !old_right.is_none() {
        page::set_left_sibling(store.page_mut(old_right)?, right);
    }
    Ok(())
}

/// Decodes an intermediate body into `(separator keys, child pids)`.
pub fn read_intermediate(page: &[u8]) -> Result<(Vec<i32>, Vec<PageId>)> {
    let header = NodeHeader::parse(page)?;
    if header.kind != NodeKind::Intermediate {
        return Err(StoreError::Corruption("intermediate read on wrong kind"));
    }
    let n = header.n as usize;
    let keys = (0..n.saturating_sub(1))
        .map(|idx| page::intermediate_key(page, idx))
        .collect::<Result<Vec<_>>>()?;
    let pids = (0..n)
        .map(|idx| page::child_at(page, idx))
        .collect::<Result<Vec<_>>>()?;
    Ok((keys, pids))
}

/// Rewrites an intermediate body wholesale and sets `n`.
pub fn write_intermediate(page: &mut [u8], keys: &[i32], pids: &[PageId]) -> Result<()> {
    if pids.is_empty() {
        return Err(StoreError::Corruption("intermediate written empty"));
    }
    if keys.len() + 1 != pids.len() {
        return Err(StoreError::Corruption("separator/child count mismatch"));
    }
    let body_start = page::NODE_HDR_LEN;
    page[body_start..].fill(0);
    for (idx, key) in keys.iter().enumerate() {
        page::set_intermediate_key(page, idx, *key)?;
    }
    for (idx, pid) in pids.iter().enumerate() {
        page::set_child_at(page, idx, *pid)?;
    }
    page::set_n(page, pids.len() as u32);
    Ok(())
}

/// Sorted insertion of a separator and the child to its right; used when a
/// split pushes one entry up.
pub fn intermediate_insert(
    store: &mut PageAllocator,
    pid: PageId,
    key: i32,
    child: PageId,
) -> Result<()> {
    let page = store.page_mut(pid)?;
    let (mut keys, mut pids) = read_intermediate(page)?;
    let pos = keys.iter().position(|&k| k > key).unwrap_or(keys.len());
    keys.insert(pos, key);
    pids.insert(pos + 1, child);
    write_intermediate(page, &keys, &pids)
}

/// Removes child slot `child_idx` and separator `key_idx` (the separator
/// between the removed child and the sibling that absorbed it).
pub fn intermediate_remove_child(
    store: &mut PageAllocator,
    pid: PageId,
    child_idx: usize,
    key_idx: usize,
) -> Result<()> {
    let page = store.page_mut(pid)?;
    let (mut keys, mut pids) = read_intermediate(page)?;
    if child_idx >= pids.len() || key_idx >= keys.len() {
        return Err(StoreError::Corruption("separator removal out of range"));
    }
    pids.remove(child_idx);
    keys.remove(key_idx);
    write_intermediate(page, &keys, &pids)
}

/// Merges an underflowing intermediate into a sibling, pulling the parent
/// separator down between the two key arrays.
pub fn intermediate_merge(
    store: &mut PageAllocator,
    tree: &TreeHeader,
    pid: PageId,
    parent: PageId,
    self_idx: usize,
) -> Result<bool> {
    let n = NodeHeader::parse(store.page(pid)?)?.n;
    for (sib_idx, merged_left) in sibling_candidates(store, parent, self_idx)? {
        let sib = page::child_at(store.page(parent)?, sib_idx)?;
        let sib_header = NodeHeader::parse(store.page(sib)?)?;
        if sib_header.kind != NodeKind::Intermediate {
            return Err(StoreError::Corruption("intermediate sibling has wrong kind"));
        }
        if n + sib_header.n > tree.branching_factor {
            continue;
        }
        let key_idx = if merged_left { self_idx - 1 } else { self_idx };
        let separator = page::intermediate_key(store.page(parent)?, key_idx)?;
        let (self_keys, self_pids) = read_intermediate(store.page(pid)?)?;
        let (sib_keys, sib_pids) = read_intermediate(store.page(sib)?)?;
        // The separator comes down between the two key runs, left run first.
        let (mut keys, mut pids) = if merged_left {
            (sib_keys, sib_pids)
        } else {
            (self_keys, self_pids)
        };
        keys.push(separator);
        let (tail_keys, tail_pids) = if merged_left {
            read_intermediate(store.page(pid)?)?
        } else {
            read_intermediate(store.page(sib)?)?
        };
        keys.extend(tail_keys);
        pids.extend(tail_pids);
        if pids.len() as u32 != n + sib_header.n {
            return Err(StoreError::Corruption("merged child count mismatch"));
        }
        write_intermediate(store.page_mut(sib)?, &keys, &pids)?;
        intermediate_remove_child(store, parent, self_idx, key_idx)?;
        unlink_siblings(store, pid)?;
        store.free(pid)?;
        debug!(node = %pid, into = %sib, "merged intermediate into sibling");
        return Ok(true);
    }
    Ok(false)
}

/// Rotates children from a richer intermediate sibling through the parent
/// separator until this node reaches minimum occupancy.
pub fn intermediate_redistribute(
    store: &mut PageAllocator,
    tree: &TreeHeader,
    pid: PageId,
    parent: PageId,
    self_idx: usize,
) -> Result<bool> {
    let min = tree.min_occupancy() as usize;
    for (sib_idx, from_left) in sibling_candidates(store, parent, self_idx)? {
        let sib = page::child_at(store.page(parent)?, sib_idx)?;
        let sib_header = NodeHeader::parse(store.page(sib)?)?;
        if sib_header.kind != NodeKind::Intermediate {
            return Err(StoreError::Corruption("intermediate sibling has wrong kind"));
        }
        if (sib_header.n as usize) <= min {
            continue;
        }
        let key_idx = if from_left { self_idx - 1 } else { self_idx };
        let mut separator = page::intermediate_key(store.page(parent)?, key_idx)?;
        let (mut self_keys, mut self_pids) = read_intermediate(store.page(pid)?)?;
        let (mut sib_keys, mut sib_pids) = read_intermediate(store.page(sib)?)?;
        while self_pids.len() < min && sib_pids.len() > min {
            if from_left {
                let moved = sib_pids.pop().ok_or(StoreError::Corruption("donor empty"))?;
                let up = sib_keys.pop().ok_or(StoreError::Corruption("donor empty"))?;
                self_keys.insert(0, separator);
                self_pids.insert(0, moved);
                separator = up;
            } else {
                let moved = sib_pids.remove(0);
                let up = sib_keys.remove(0);
                self_keys.push(separator);
                self_pids.push(moved);
                separator = up;
            }
        }
        write_intermediate(store.page_mut(pid)?, &self_keys, &self_pids)?;
        write_intermediate(store.page_mut(sib)?, &sib_keys, &sib_pids)?;
        page::set_intermediate_key(store.page_mut(parent)?, key_idx, separator)?;
        debug!(node = %pid, from = %sib, "redistributed intermediate children");
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (PageAllocator, TreeHeader, PageId) {
        let tree = TreeHeader::new(128, 4, vec![]).unwrap();
        let mut store = PageAllocator::new(128, 64).unwrap();
        let pid = store.allocate().unwrap();
        init(&mut store, pid).unwrap();
        (store, tree, pid)
    }

    #[test]
    fn first_insert_allocates_the_leaf() -> Result<()> {
        let (mut store, tree, pid) = setup();
        insert(&mut store, &tree, pid, 10, &Record::new(1, b"x".to_vec()))?;
        let header = NodeHeader::parse(store.page(pid)?)?;
        assert_eq!(header.n, 1);
        let owned = header.initial_child()?;
        assert!(!owned.is_none());
        let entry = page::branch_entry(store.page(pid)?, 0)?;
        assert_eq!(entry.leaf, owned);
        Ok(())
    }

    #[test]
    fn triples_stay_sorted() -> Result<()> {
        let (mut store, tree, pid) = setup();
        for key in [30, 10, 20] {
            insert(&mut store, &tree, pid, key, &Record::new(1, b"v".to_vec()))?;
        }
        let all = entries(store.page(pid)?)?;
        let keys: Vec<i32> = all.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![10, 20, 30]);
        Ok(())
    }

    #[test]
    fn duplicate_keys_are_rejected() -> Result<()> {
        let (mut store, tree, pid) = setup();
        insert(&mut store, &tree, pid, 10, &Record::new(1, b"a".to_vec()))?;
        assert!(matches!(
            insert(&mut store, &tree, pid, 10, &Record::new(1, b"b".to_vec())),
            Err(StoreError::DuplicateKey(10))
        ));
        Ok(())
    }

    #[test]
    fn update_in_place_keeps_the_offset() -> Result<()> {
        let (mut store, tree, pid) = setup();
        insert(&mut store, &tree, pid, 10, &Record::new(1, b"abcdef".to_vec()))?;
        let before = page::branch_entry(store.page(pid)?, 0)?;
        update(&mut store, &tree, pid, 10, &Record::new(1, b"xy".to_vec()))?;
        let after = page::branch_entry(store.page(pid)?, 0)?;
        assert_eq!(before.offset, after.offset);
        assert_eq!(
            Record::read_from(store.page(after.leaf)?, after.offset as usize)?.payload,
            b"xy".to_vec()
        );
        Ok(())
    }

    #[test]
    fn growing_update_moves_the_record() -> Result<()> {
        let (mut store, tree, pid) = setup();
        insert(&mut store, &tree, pid, 10, &Record::new(1, b"ab".to_vec()))?;
        insert(&mut store, &tree, pid, 11, &Record::new(1, b"cd".to_vec()))?;
        update(&mut store, &tree, pid, 10, &Record::new(1, b"longer-value".to_vec()))?;
        let (_, entry) = find_entry(store.page(pid)?, 10)?.unwrap();
        assert_eq!(
            Record::read_from(store.page(entry.leaf)?, entry.offset as usize)?.payload,
            b"longer-value".to_vec()
        );
        Ok(())
    }

    #[test]
    fn delete_removes_triple_and_record() -> Result<()> {
        let (mut store, tree, pid) = setup();
        insert(&mut store, &tree, pid, 10, &Record::new(1, b"a".to_vec()))?;
        insert(&mut store, &tree, pid, 20, &Record::new(1, b"b".to_vec()))?;
        delete(&mut store, pid, 10)?;
        assert!(find_entry(store.page(pid)?, 10)?.is_none());
        assert_eq!(NodeHeader::parse(store.page(pid)?)?.n, 1);
        assert!(matches!(
            delete(&mut store, pid, 10),
            Err(StoreError::KeyNotFound(10))
        ));
        Ok(())
    }

    #[test]
    fn intermediate_insert_keeps_separators_sorted() -> Result<()> {
        let (mut store, _tree, _pid) = setup();
        let node = store.allocate()?;
        {
            let page = store.page_mut(node)?;
            page::init_node(page, NodeKind::Intermediate);
            write_intermediate(page, &[20], &[PageId(10), PageId(11)])?;
        }
        intermediate_insert(&mut store, node, 10, PageId(12))?;
        intermediate_insert(&mut store, node, 30, PageId(13))?;
        let (keys, pids) = read_intermediate(store.page(node)?)?;
        assert_eq!(keys, vec![10, 20, 30]);
        assert_eq!(pids, vec![PageId(10), PageId(12), PageId(11), PageId(13)]);
        Ok(())
    }

    #[test]
    fn remove_child_drops_the_adjacent_separator() -> Result<()> {
        let (mut store, _tree, _pid) = setup();
        let node = store.allocate()?;
        {
            let page = store.page_mut(node)?;
            page::init_node(page, NodeKind::Intermediate);
            write_intermediate(page, &[10, 20], &[PageId(5), PageId(6), PageId(7)])?;
        }
        // Child 1 merged leftward: separator 10 goes with it.
        intermediate_remove_child(&mut store, node, 1, 0)?;
        let (keys, pids) = read_intermediate(store.page(node)?)?;
        assert_eq!(keys, vec![20]);
        assert_eq!(pids, vec![PageId(5), PageId(7)]);
        Ok(())
    }
}
