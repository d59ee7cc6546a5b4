pub mod alloc;
pub mod error;
pub mod pool;
pub mod tree;
pub mod types;

pub use crate::alloc::PageAllocator;
pub use crate::error::{Result, StoreError};
pub use crate::pool::{BufferPool, ReadPageGuard, WritePageGuard};
pub use crate::tree::{BPTree, FieldKind, Record, TreeOptions};
pub use crate::types::PageId;
