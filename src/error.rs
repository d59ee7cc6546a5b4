use std::io;

use thiserror::Error;

use crate::types::PageId;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("buffer pool full")]
    PoolFull,
    #[error("out of pages")]
    OutOfPages,
    #[error("double free of page {0}")]
    DoubleFree(PageId),
    #[error("duplicate key {0}")]
    DuplicateKey(i32),
    #[error("key {0} not found")]
    KeyNotFound(i32),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}
