//! Backing memory for loaded stores.
//!
//! A finalized store is a single contiguous byte region: either a read-only
//! file mapping or a caller-supplied buffer. The store owns its [`StoreMem`]
//! and keeps only offsets into it, so views never outlive the mapping.

use crate::error::Result;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Owned backing memory of a loaded store.
pub enum StoreMem {
    /// Read-only file mapping.
    Mapped(Mmap),
    /// Heap buffer supplied by the caller or produced by a builder.
    Owned(Vec<u8>),
}

impl StoreMem {
    /// Map a file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_file(&file)
    }

    /// Map an already open file read-only.
    pub fn from_file(file: &File) -> Result<Self> {
        // SAFETY: read-only mapping; callers must not truncate the file
        // while the store is loaded.
        let mmap = unsafe { Mmap::map(file)? };
        Ok(Self::Mapped(mmap))
    }

    /// Map a file with prefaulted pages.
    pub fn open_populated(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: as in `from_file`.
        let mmap = unsafe { memmap2::MmapOptions::new().populate().map(&file)? };
        Ok(Self::Mapped(mmap))
    }

    /// Wrap an owned buffer.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::Owned(data)
    }

    /// The full byte region.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Mapped(m) => m,
            Self::Owned(v) => v,
        }
    }

    /// Region length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// True when the region is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_mapped_matches_owned() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&payload).unwrap();
        f.flush().unwrap();

        let mapped = StoreMem::open(f.path()).unwrap();
        let owned = StoreMem::from_vec(payload.clone());
        assert_eq!(mapped.as_slice(), owned.as_slice());
        assert_eq!(mapped.len(), payload.len());
    }
}
