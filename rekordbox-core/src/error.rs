//! Error types for rekordbox-core
//!
//! Only failures that stop a whole file from being read live here. Damage
//! inside an otherwise readable file is recorded in a
//! [`CorruptionReport`](crate::report::CorruptionReport) instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Binary format error: {0}")]
    BinRw(String),

    #[error("Invalid database header: {0}")]
    InvalidHeader(String),

    #[error("Invalid page size {0} (must be a power of two of at least {1} bytes)")]
    InvalidPageSize(u32, u32),

    #[error("Invalid analysis file: {0}")]
    InvalidSidecar(String),

    #[error(transparent)]
    OutOfBounds(#[from] OutOfBounds),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        Error::BinRw(e.to_string())
    }
}

/// A read that would have gone past the end of a buffer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("read of {length} bytes at offset {offset} exceeds buffer of {available} bytes")]
pub struct OutOfBounds {
    pub offset: usize,
    pub length: usize,
    pub available: usize,
}
