//! Read-only byte buffers for database and analysis files
//!
//! A [`ByteSource`] is either loaded fully into memory or memory-mapped.
//! Every accessor is bounds-checked; nothing here can read past the end.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{OutOfBounds, Result};

enum Backing {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

/// Immutable byte buffer with checked random access
pub struct ByteSource {
    backing: Backing,
}

impl ByteSource {
    /// Wrap bytes already in memory
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            backing: Backing::Owned(bytes),
        }
    }

    /// Load a whole file into memory
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_vec(std::fs::read(path)?))
    }

    /// Memory-map a file. Empty files are loaded instead, since a
    /// zero-length mapping is rejected on some platforms.
    pub fn map<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Self::from_vec(Vec::new()));
        }
        // SAFETY: the mapping is only ever read. Another process truncating
        // the file while it is mapped is not something we can guard against.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            backing: Backing::Mapped(map),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Owned(bytes) => bytes,
            Backing::Mapped(map) => map,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    /// Borrow `length` bytes starting at `offset`
    pub fn slice(&self, offset: usize, length: usize) -> std::result::Result<&[u8], OutOfBounds> {
        slice(self.as_bytes(), offset, length)
    }

    pub fn read_u8(&self, offset: usize) -> std::result::Result<u8, OutOfBounds> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn read_u16_le(&self, offset: usize) -> std::result::Result<u16, OutOfBounds> {
        let b = self.slice(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&self, offset: usize) -> std::result::Result<u32, OutOfBounds> {
        let b = self.slice(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32_be(&self, offset: usize) -> std::result::Result<u32, OutOfBounds> {
        let b = self.slice(offset, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

impl From<Vec<u8>> for ByteSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_vec(bytes)
    }
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteSource")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Checked sub-slice of any buffer
pub(crate) fn slice(bytes: &[u8], offset: usize, length: usize) -> std::result::Result<&[u8], OutOfBounds> {
    let out_of_bounds = OutOfBounds {
        offset,
        length,
        available: bytes.len(),
    };
    let end = offset.checked_add(length).ok_or(out_of_bounds)?;
    bytes.get(offset..end).ok_or(out_of_bounds)
}

pub(crate) fn u16_le(bytes: &[u8], offset: usize) -> Option<u16> {
    let b = slice(bytes, offset, 2).ok()?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

pub(crate) fn u32_le(bytes: &[u8], offset: usize) -> Option<u32> {
    let b = slice(bytes, offset, 4).ok()?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn u32_be(bytes: &[u8], offset: usize) -> Option<u32> {
    let b = slice(bytes, offset, 4).ok()?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}
