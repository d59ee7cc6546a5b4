//! Page-0 codec: the persistent tree-wide parameters.

use std::convert::TryInto;

use crate::error::{Result, StoreError};
use crate::tree::page::{BRANCH_ENTRY_LEN, NODE_HDR_LEN};

/// Largest page size the leaf free-list encoding supports: chain offsets are
/// `u16` and offset values must stay below the page size.
pub const MAX_TREE_PAGE_SIZE: u32 = 32 * 1024;

const FIXED_FIELDS_LEN: usize = 12;

/// Kind of one field of the record schema. Opaque to the tree itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FieldKind {
    Int = 0,
    Float = 1,
    Varchar = 2,
}

impl FieldKind {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FieldKind::Int),
            1 => Ok(FieldKind::Float),
            2 => Ok(FieldKind::Varchar),
            _ => Err(StoreError::Corruption("unknown field kind")),
        }
    }
}

/// Tree-wide parameters stored in page 0.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeHeader {
    pub page_size: u32,
    pub branching_factor: u32,
    pub schema: Vec<FieldKind>,
}

impl TreeHeader {
    pub fn new(page_size: u32, branching_factor: u32, schema: Vec<FieldKind>) -> Result<Self> {
        let header = Self {
            page_size,
            branching_factor,
            schema,
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if !(2..=2048).contains(&self.branching_factor) {
            return Err(StoreError::Invalid("branching factor out of range"));
        }
        if self.page_size % 32 != 0 {
            return Err(StoreError::Invalid("page size must be a multiple of 32"));
        }
        if self.page_size > MAX_TREE_PAGE_SIZE {
            return Err(StoreError::Invalid("page size too large for u16 offsets"));
        }
        // One lazy slot beyond the branching factor must fit, triples being
        // the widest entry kind.
        let required = (self.branching_factor as usize + 1) * BRANCH_ENTRY_LEN + NODE_HDR_LEN;
        if required > self.page_size as usize {
            return Err(StoreError::Invalid(
                "page size too small for the branching factor",
            ));
        }
        if FIXED_FIELDS_LEN + self.schema.len() * 4 > self.page_size as usize {
            return Err(StoreError::Invalid("page size too small for the schema"));
        }
        Ok(())
    }

    pub fn encode(&self, page: &mut [u8]) -> Result<()> {
        if page.len() < FIXED_FIELDS_LEN + self.schema.len() * 4 {
            return Err(StoreError::Invalid("header page too small"));
        }
        page.fill(0);
        page[0..4].copy_from_slice(&self.page_size.to_le_bytes());
        page[4..8].copy_from_slice(&self.branching_factor.to_le_bytes());
        let num_fields = u32::try_from(self.schema.len())
            .map_err(|_| StoreError::Invalid("schema field count exceeds u32"))?;
        page[8..12].copy_from_slice(&num_fields.to_le_bytes());
        for (i, kind) in self.schema.iter().enumerate() {
            let start = FIXED_FIELDS_LEN + i * 4;
            page[start..start + 4].copy_from_slice(&(*kind as u32).to_le_bytes());
        }
        Ok(())
    }

    pub fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < FIXED_FIELDS_LEN {
            return Err(StoreError::Corruption("header page truncated"));
        }
        let page_size = u32::from_le_bytes(page[0..4].try_into().unwrap());
        let branching_factor = u32::from_le_bytes(page[4..8].try_into().unwrap());
        let num_fields = u32::from_le_bytes(page[8..12].try_into().unwrap()) as usize;
        if FIXED_FIELDS_LEN + num_fields * 4 > page.len() {
            return Err(StoreError::Corruption("schema runs past header page"));
        }
        let mut schema = Vec::with_capacity(num_fields);
        for i in 0..num_fields {
            let start = FIXED_FIELDS_LEN + i * 4;
            let raw = u32::from_le_bytes(page[start..start + 4].try_into().unwrap());
            schema.push(FieldKind::from_u32(raw)?);
        }
        let header = Self {
            page_size,
            branching_factor,
            schema,
        };
        header.validate().map_err(|_| {
            StoreError::Corruption("header page holds invalid tree parameters")
        })?;
        Ok(header)
    }

    /// Minimum entry count of a non-root node.
    pub fn min_occupancy(&self) -> u32 {
        self.branching_factor.div_ceil(2)
    }

    /// Bytes available to records and free blocks in one leaf page.
    pub fn leaf_capacity(&self) -> usize {
        self.page_size as usize - NODE_HDR_LEN
    }
}
