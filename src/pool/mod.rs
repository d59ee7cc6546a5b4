mod buffer_pool;
mod frame;
mod guard;

pub use buffer_pool::{AccessMode, BufferPool};
pub use guard::{ReadPageGuard, WritePageGuard};
