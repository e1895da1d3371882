//! Durable monotonic counters.
//!
//! A [`PersistentSequence`] never hands out the same value twice, even across
//! crashes. It reserves a block of values on disk before using any of them;
//! values reserved but not handed out before a crash are skipped.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StorageError};

#[derive(Debug, Serialize, Deserialize)]
struct SequenceFile {
    /// Every value below this may have been handed out.
    next: u64,
}

#[derive(Debug)]
struct SequenceState {
    next: u64,
    /// Values below this are durably reserved.
    limit: u64,
}

/// A crash-safe counter backed by one small JSON file.
#[derive(Debug)]
pub struct PersistentSequence {
    path: PathBuf,
    reserve: u64,
    state: Mutex<SequenceState>,
}

impl PersistentSequence {
    /// Opens the counter stored at `path`, starting from zero if the file
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptState`] if the file is unreadable JSON
    /// and [`StorageError::Io`] on I/O failure.
    pub fn open(path: &Path, reserve: u64) -> Result<Self> {
        let next = match fs::read_to_string(path) {
            Ok(text) => {
                let stored: SequenceFile = serde_json::from_str(&text)
                    .map_err(|e| StorageError::corrupt(path, format!("bad sequence file: {e}")))?;
                stored.next
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StorageError::io(path, e).into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            reserve: reserve.max(1),
            state: Mutex::new(SequenceState { next, limit: next }),
        })
    }

    /// Returns the next value, reserving a new block on disk if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the reservation cannot be persisted.
    /// No value is handed out in that case.
    pub fn next(&self) -> Result<u64> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.next >= state.limit {
            let limit = state.next + self.reserve;
            let json = serde_json::to_vec(&SequenceFile { next: limit })
                .map_err(|e| StorageError::corrupt(&self.path, e.to_string()))?;
            write_replace(&self.path, &json)?;
            debug!(path = %self.path.display(), limit, "reserved sequence block");
            state.limit = limit;
        }
        let value = state.next;
        state.next += 1;
        Ok(value)
    }

    /// The value the next call to [`PersistentSequence::next`] returns.
    pub fn peek(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).next
    }
}

/// Replaces `path` with `bytes` durably: write a sibling temporary, fsync,
/// rename over the target, then fsync the directory.
pub(crate) fn write_replace(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp~");
    let tmp = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp).map_err(|e| StorageError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| StorageError::io(&tmp, e))?;
    file.sync_all().map_err(|e| StorageError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;
    sync_parent(path)
}

/// Fsyncs the directory holding `path` so a rename or create is durable.
#[cfg(unix)]
pub(crate) fn sync_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        let dir = File::open(parent).map_err(|e| StorageError::io(parent, e))?;
        dir.sync_all().map_err(|e| StorageError::io(parent, e))?;
    }
    Ok(())
}

/// Directories cannot be opened for syncing here.
#[cfg(not(unix))]
pub(crate) fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}
