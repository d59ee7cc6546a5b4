//! Binary layout primitives for leaf contents: records and free blocks.

use std::convert::TryInto;

use crate::error::{Result, StoreError};

/// `u32 type || u32 size` precedes every record payload.
pub const RECORD_HDR_LEN: usize = 8;

/// `u16 next || u16 size`, written in place at the block's own offset.
pub const FREE_BLOCK_LEN: usize = 4;

/// A variable-length record: an opaque type tag and a payload.
///
/// The on-page footprint is `RECORD_HDR_LEN + payload.len()`; the type tag is
/// not interpreted by the tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub type_tag: u32,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(type_tag: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_tag,
            payload: payload.into(),
        }
    }

    /// Total bytes this record occupies on a page.
    pub fn footprint(&self) -> usize {
        RECORD_HDR_LEN + self.payload.len()
    }

    pub fn write_to(&self, page: &mut [u8], offset: usize) -> Result<()> {
        let end = offset
            .checked_add(self.footprint())
            .ok_or(StoreError::Invalid("record offset overflow"))?;
        if end > page.len() {
            return Err(StoreError::Invalid("record does not fit in page"));
        }
        let size = u32::try_from(self.payload.len())
            .map_err(|_| StoreError::Invalid("record payload exceeds u32"))?;
        page[offset..offset + 4].copy_from_slice(&self.type_tag.to_le_bytes());
        page[offset + 4..offset + 8].copy_from_slice(&size.to_le_bytes());
        page[offset + 8..end].copy_from_slice(&self.payload);
        Ok(())
    }

    pub fn read_from(page: &[u8], offset: usize) -> Result<Record> {
        if offset + RECORD_HDR_LEN > page.len() {
            return Err(StoreError::Corruption("record header beyond page"));
        }
        let type_tag = u32::from_le_bytes(page[offset..offset + 4].try_into().unwrap());
        let size =
            u32::from_le_bytes(page[offset + 4..offset + 8].try_into().unwrap()) as usize;
        let start = offset + RECORD_HDR_LEN;
        let end = start
            .checked_add(size)
            .ok_or(StoreError::Corruption("record size overflow"))?;
        if end > page.len() {
            return Err(StoreError::Corruption("record payload beyond page"));
        }
        Ok(Record {
            type_tag,
            payload: page[start..end].to_vec(),
        })
    }

    /// Footprint of the record currently stored at `offset`, without copying
    /// its payload out.
    pub fn footprint_at(page: &[u8], offset: usize) -> Result<usize> {
        if offset + RECORD_HDR_LEN > page.len() {
            return Err(StoreError::Corruption("record header beyond page"));
        }
        let size =
            u32::from_le_bytes(page[offset + 4..offset + 8].try_into().unwrap()) as usize;
        if offset + RECORD_HDR_LEN + size > page.len() {
            return Err(StoreError::Corruption("record payload beyond page"));
        }
        Ok(RECORD_HDR_LEN + size)
    }
}

/// Link to the next free block of a leaf's chain.
///
/// Offset 0 is inside the node header, so it doubles as the end-of-chain
/// sentinel; every chain stays inside its own page and continuation onto an
/// overflow page rides the node header's `next_overflow` link instead of an
/// offset encoding.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NextPtr {
    End,
    InPage(u16),
}

impl NextPtr {
    pub fn encode(self) -> u16 {
        match self {
            NextPtr::End => 0,
            NextPtr::InPage(offset) => offset,
        }
    }

    pub fn decode(raw: u16, page_size: usize) -> Result<NextPtr> {
        if raw == 0 {
            return Ok(NextPtr::End);
        }
        if (raw as usize) < super::page::NODE_HDR_LEN {
            return Err(StoreError::Corruption("free link points into header"));
        }
        if raw as usize >= page_size {
            return Err(StoreError::Corruption("free link beyond page"));
        }
        Ok(NextPtr::InPage(raw))
    }
}

/// One node of a leaf's free-block chain. `size` includes these four header
/// bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FreeBlock {
    pub next: NextPtr,
    pub size: u16,
}

impl FreeBlock {
    pub fn read_from(page: &[u8], offset: u16) -> Result<FreeBlock> {
        let start = offset as usize;
        if start + FREE_BLOCK_LEN > page.len() {
            return Err(StoreError::Corruption("free block beyond page"));
        }
        let raw_next = u16::from_le_bytes(page[start..start + 2].try_into().unwrap());
        let size = u16::from_le_bytes(page[start + 2..start + 4].try_into().unwrap());
        Ok(FreeBlock {
            next: NextPtr::decode(raw_next, page.len())?,
            size,
        })
    }

    pub fn write_to(&self, page: &mut [u8], offset: u16) -> Result<()> {
        let start = offset as usize;
        if start + FREE_BLOCK_LEN > page.len() {
            return Err(StoreError::Corruption("free block beyond page"));
        }
        page[start..start + 2].copy_from_slice(&self.next.encode().to_le_bytes());
        page[start + 2..start + 4].copy_from_slice(&self.size.to_le_bytes());
        Ok(())
    }
}
