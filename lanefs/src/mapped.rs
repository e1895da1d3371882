//! Memory-mapped file access with the sharing mode in the type.
//!
//! [`SharedMapping`] is read-only and can be handed to many readers.
//! [`ExclusiveMapping`] is writable and only reachable through `&mut`, so the
//! borrow checker rules out a reader observing a half-written region.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::error::{Result, StorageError};

/// A read-only mapping of a whole file.
#[derive(Debug)]
pub struct SharedMapping {
    path: PathBuf,
    /// `None` for empty files, which cannot be mapped.
    mmap: Option<Mmap>,
}

impl SharedMapping {
    /// Maps `path` read-only.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be opened or mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
        let len = file.metadata().map_err(|e| StorageError::io(path, e))?.len();
        let mmap = if len == 0 {
            None
        } else {
            // SAFETY: The file is opened read-only and lanefs only replaces
            // mapped files by rename, never by truncating them in place, so
            // the mapped pages stay valid for the life of the mapping.
            Some(unsafe { Mmap::map(&file) }.map_err(|e| StorageError::io(path, e))?)
        };
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A writable mapping of a freshly sized file.
#[derive(Debug)]
pub struct ExclusiveMapping {
    path: PathBuf,
    mmap: MmapMut,
    _file: File,
}

impl ExclusiveMapping {
    /// Creates or truncates `path` to `len` bytes and maps it read-write.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be sized or mapped.
    pub fn create(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StorageError::io(path, e))?;
        file.set_len(len).map_err(|e| StorageError::io(path, e))?;
        // SAFETY: The file was just created and sized by us and is not yet
        // visible under its final name, so nothing else maps or resizes it.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| StorageError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            _file: file,
        })
    }

    /// The mapped bytes, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    /// Flushes dirty pages to disk and releases the mapping.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the flush fails.
    pub fn flush(self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| StorageError::io(&self.path, e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_share() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.bin");

        let mut exclusive = ExclusiveMapping::create(&path, 8).unwrap();
        exclusive.as_mut_slice().copy_from_slice(b"lanefs!!");
        exclusive.flush().unwrap();

        let shared = SharedMapping::open(&path).unwrap();
        assert_eq!(shared.as_slice(), b"lanefs!!");
        assert_eq!(shared.path(), path);
    }

    #[test]
    fn test_empty_file_maps_to_empty_slice() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert!(SharedMapping::open(&path).unwrap().as_slice().is_empty());
    }
}
