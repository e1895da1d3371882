//! Whole-file blob storage.
//!
//! Each blob is one file placed by the directory hash of its id's path.
//! Files are replaced atomically, so a reader sees either the old or the
//! new contents.
//!
//! # File format
//!
//! ```text
//! [0..4)    magic "LNBL"
//! [4..12)   origin (u64 LE)
//! [12..16)  CRC32 of the contents
//! [16..)    contents
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::debug;

use crate::config::PlacementConfig;
use crate::dirhash::DirectoryHashFactory;
use crate::error::{Result, StorageError};
use crate::id::FsId;
use crate::journal::remove_if_exists;
use crate::sequence::write_replace;

const BLOB_MAGIC: [u8; 4] = *b"LNBL";
const BLOB_HEADER: usize = 16;
const BLOB_TYPE_DIR: &str = "blob";

/// Committed contents of a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Originator tag of the writer.
    pub origin: u64,
    /// Contents.
    pub bytes: Vec<u8>,
}

/// Committed blobs of one storage root.
#[derive(Debug)]
pub struct BlobStore {
    hashes: DirectoryHashFactory,
}

impl BlobStore {
    /// Creates a store placing blobs through `placement`.
    pub fn new(placement: PlacementConfig, files_per_store: u64, max_files_per_dir: u32) -> Self {
        Self::with_type_dir(BLOB_TYPE_DIR, placement, files_per_store, max_files_per_dir)
    }

    /// Creates a store whose hashes live under `type_dir` in each root, so
    /// several kinds of whole-file records can share one placement table.
    pub fn with_type_dir(
        type_dir: &str,
        placement: PlacementConfig,
        files_per_store: u64,
        max_files_per_dir: u32,
    ) -> Self {
        Self {
            hashes: DirectoryHashFactory::new(type_dir, placement, files_per_store, max_files_per_dir),
        }
    }

    fn file_for(&self, id: &FsId, create: bool) -> Result<Option<PathBuf>> {
        let Some(hash) = self.hashes.find_dir_hash(id, create)? else {
            return Ok(None);
        };
        let key = id.to_string();
        let file = if create {
            hash.prepare_file(&key)?
        } else {
            hash.id_to_file(&key)
        };
        Ok(Some(file))
    }

    /// Reads a committed blob, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptState`] if the file fails its checksum
    /// and [`StorageError::Io`] if it cannot be read.
    pub fn get(&self, id: &FsId) -> Result<Option<Blob>> {
        let Some(file) = self.file_for(id, false)? else {
            return Ok(None);
        };
        let raw = match fs::read(&file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(file, e).into()),
        };
        if raw.len() < BLOB_HEADER || raw[..4] != BLOB_MAGIC {
            return Err(StorageError::corrupt(file, "not a blob file").into());
        }
        let mut origin = [0u8; 8];
        origin.copy_from_slice(&raw[4..12]);
        let crc = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);
        let bytes = raw[BLOB_HEADER..].to_vec();
        let actual = crc32fast::hash(&bytes);
        if actual != crc {
            return Err(StorageError::corrupt(
                file,
                format!("checksum mismatch: expected {crc:08x}, got {actual:08x}"),
            )
            .into());
        }
        Ok(Some(Blob {
            origin: u64::from_le_bytes(origin),
            bytes,
        }))
    }

    /// `true` if a committed blob exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptState`] if the directory hash is
    /// unusable.
    pub fn exists(&self, id: &FsId) -> Result<bool> {
        Ok(self.file_for(id, false)?.is_some_and(|f| f.is_file()))
    }

    /// Atomically replaces the blob.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be written.
    pub fn put(&self, id: &FsId, origin: u64, bytes: &[u8]) -> Result<()> {
        let Some(file) = self.file_for(id, true)? else {
            return Err(StorageError::NotFound { id: id.to_string() }.into());
        };
        let mut raw = Vec::with_capacity(BLOB_HEADER + bytes.len());
        raw.extend_from_slice(&BLOB_MAGIC);
        raw.extend_from_slice(&origin.to_le_bytes());
        raw.extend_from_slice(&crc32fast::hash(bytes).to_le_bytes());
        raw.extend_from_slice(bytes);
        write_replace(&file, &raw)?;
        debug!(%id, len = bytes.len(), "stored blob");
        Ok(())
    }

    /// Removes the blob. Removing a missing blob succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be removed.
    pub fn remove(&self, id: &FsId) -> Result<()> {
        match self.file_for(id, false)? {
            Some(file) => remove_if_exists(&file),
            None => Ok(()),
        }
    }

    /// Committed blob ids starting with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptState`] if a hash or file name is
    /// unusable and [`StorageError::Io`] if a directory cannot be listed.
    pub fn find_ids(&self, prefix: &str) -> Result<Vec<FsId>> {
        let mut ids = Vec::new();
        for hash in self.hashes.hashes_under(prefix)? {
            for raw in hash.find_all_ids()? {
                let id = FsId::parse(&raw)
                    .map_err(|e| StorageError::corrupt(hash.root(), format!("stored blob name '{raw}': {e}")))?;
                if id.has_prefix(prefix) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// The factory placing blob hashes, for diagnostics.
    pub fn hashes(&self) -> &DirectoryHashFactory {
        &self.hashes
    }
}
