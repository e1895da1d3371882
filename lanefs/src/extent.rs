//! Which byte ranges of a file are backed by storage.
//!
//! Container files are sparse: a lane that was never written leaves holes.
//! An [`ExtentMapper`] reports the allocated ranges as closed byte
//! intervals. On Linux, [`SparseExtents`] asks the filesystem with
//! `SEEK_DATA`/`SEEK_HOLE`; elsewhere [`WholeFileExtents`] reports the whole
//! file as one extent.

#[cfg(target_os = "linux")]
use std::fs::File;
use std::path::Path;

use crate::error::{Result, StorageError};
use crate::interval::Interval;

/// Reports the allocated byte ranges of a file.
pub trait ExtentMapper: Send + Sync + std::fmt::Debug {
    /// Allocated ranges of `path`, sorted and disjoint. An empty file has
    /// none.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be inspected.
    fn extents_of(&self, path: &Path) -> Result<Vec<Interval>>;
}

/// Treats every file as fully allocated.
#[derive(Debug, Clone, Copy, Default)]
pub struct WholeFileExtents;

impl ExtentMapper for WholeFileExtents {
    fn extents_of(&self, path: &Path) -> Result<Vec<Interval>> {
        let len = std::fs::metadata(path).map_err(|e| StorageError::io(path, e))?.len();
        let len = i64::try_from(len).map_err(|_| StorageError::corrupt(path, "file length overflows"))?;
        Ok(if len == 0 {
            Vec::new()
        } else {
            vec![Interval::new(0, len - 1)]
        })
    }
}

/// Finds holes with `lseek(SEEK_DATA)` and `lseek(SEEK_HOLE)`.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SparseExtents;

#[cfg(target_os = "linux")]
impl ExtentMapper for SparseExtents {
    fn extents_of(&self, path: &Path) -> Result<Vec<Interval>> {
        use std::os::unix::io::AsRawFd;

        let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
        let fd = file.as_raw_fd();
        let mut extents = Vec::new();
        let mut position: libc::off_t = 0;
        loop {
            // SAFETY: `fd` is an open descriptor owned by `file`, which
            // outlives this call. lseek does not touch memory.
            let data = unsafe { libc::lseek(fd, position, libc::SEEK_DATA) };
            if data < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENXIO) {
                    break;
                }
                return Err(StorageError::io(path, err).into());
            }
            // SAFETY: as above.
            let hole = unsafe { libc::lseek(fd, data, libc::SEEK_HOLE) };
            if hole < 0 {
                return Err(StorageError::io(path, std::io::Error::last_os_error()).into());
            }
            extents.push(Interval::new(i64::from(data), i64::from(hole) - 1));
            position = hole;
        }
        Ok(extents)
    }
}

/// The best mapper this platform supports.
pub fn platform_mapper() -> Box<dyn ExtentMapper> {
    #[cfg(target_os = "linux")]
    {
        Box::new(SparseExtents)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(WholeFileExtents)
    }
}
