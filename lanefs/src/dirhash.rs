//! Deterministic sharding of ids into a bounded-fanout directory tree.
//!
//! A [`DirectoryHash`] places each id in a leaf directory chosen by hashing
//! the id string. The tree has `levels` levels of `bins` directories each, so
//! `bins^levels` leaves share the files and no leaf grows much beyond
//! `max_files_per_dir` entries.
//!
//! # Layout
//!
//! ```text
//! <root>/hash.json                  (written by DirectoryHashFactory)
//! <root>/~1a/~03/<encoded id>       (levels = 2)
//! ```
//!
//! Bin directories start with `~`, which never appears in an id path
//! segment, so nested per-path hashes cannot collide with bins. File names
//! are the percent-encoded id, so [`DirectoryHash::file_to_id`] inverts
//! [`DirectoryHash::id_to_file`] exactly.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PlacementConfig;
use crate::error::{ConfigError, Result, StorageError};
use crate::id::FsId;
use crate::sequence::write_replace;

/// Name of the per-hash metadata file.
pub const HASH_CONFIG_FILE: &str = "hash.json";

/// Prefix of bin directory names.
const BIN_PREFIX: char = '~';

/// Attempts made for idempotent directory creation.
const MKDIR_ATTEMPTS: usize = 3;

/// A directory tree that ids are sharded into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryHash {
    root: PathBuf,
    bins: u32,
    levels: u32,
    max_files_per_dir: u32,
}

impl DirectoryHash {
    /// Sizes a new hash for `target_total_files` and creates its root.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero target or a fanout below 2,
    /// and [`StorageError::Io`] if the root cannot be created.
    pub fn create(target_total_files: u64, max_files_per_dir: u32, root: &Path) -> Result<Self> {
        if target_total_files == 0 || max_files_per_dir < 2 {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "directory hash needs a positive target and fanout >= 2, got {target_total_files}/{max_files_per_dir}"
                ),
            }
            .into());
        }
        let leaves = target_total_files.div_ceil(u64::from(max_files_per_dir));
        let bins = leaves.clamp(2, u64::from(max_files_per_dir));
        let mut levels = 1u32;
        let mut capacity = bins;
        while capacity < leaves {
            capacity = capacity.saturating_mul(bins);
            levels += 1;
        }
        #[allow(clippy::cast_possible_truncation)] // bins <= max_files_per_dir: u32
        let hash = Self {
            root: root.to_path_buf(),
            bins: bins as u32,
            levels,
            max_files_per_dir,
        };
        create_dir_retrying(root)?;
        debug!(root = %root.display(), bins = hash.bins, levels, "created directory hash");
        Ok(hash)
    }

    /// Reopens an existing hash with known geometry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `bins` or `levels` is zero.
    pub fn open(root: &Path, bins: u32, levels: u32, max_files_per_dir: u32) -> Result<Self> {
        if bins == 0 || levels == 0 {
            return Err(ConfigError::Invalid {
                reason: format!("directory hash geometry {bins}x{levels} is empty"),
            }
            .into());
        }
        Ok(Self {
            root: root.to_path_buf(),
            bins,
            levels,
            max_files_per_dir,
        })
    }

    /// Root directory of the tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directories per level.
    pub fn bins(&self) -> u32 {
        self.bins
    }

    /// Depth of the tree.
    pub fn levels(&self) -> u32 {
        self.levels
    }

    /// Configured leaf fanout.
    pub fn max_files_per_dir(&self) -> u32 {
        self.max_files_per_dir
    }

    /// The file an id is stored in. Does not touch the filesystem.
    pub fn id_to_file(&self, id: &str) -> PathBuf {
        let mut h = fnv1a(id.as_bytes());
        let mut path = self.root.clone();
        for _ in 0..self.levels {
            let bin = h % u64::from(self.bins);
            h /= u64::from(self.bins);
            path.push(format!("{BIN_PREFIX}{bin:x}"));
        }
        path.push(encode_file_name(id));
        path
    }

    /// Recovers the id stored in `file`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptState`] if the file name is not an
    /// encoded id.
    pub fn file_to_id(&self, file: &Path) -> Result<String> {
        file.file_name()
            .and_then(|n| n.to_str())
            .and_then(decode_file_name)
            .ok_or_else(|| StorageError::corrupt(file, "file name does not encode an id").into())
    }

    /// Like [`DirectoryHash::id_to_file`] but creates the leaf directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directories cannot be created.
    pub fn prepare_file(&self, id: &str) -> Result<PathBuf> {
        let file = self.id_to_file(id);
        if let Some(parent) = file.parent() {
            create_dir_retrying(parent)?;
        }
        Ok(file)
    }

    /// Every id with a file in the tree, sorted. Files whose names are not
    /// encoded ids (temporaries) are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if a directory cannot be listed.
    pub fn find_all_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for leaf in self.leaf_dirs()? {
            for entry in read_dir(&leaf)? {
                let path = entry.path();
                match path.file_name().and_then(|n| n.to_str()).and_then(decode_file_name) {
                    Some(id) => ids.push(id),
                    None => debug!(file = %path.display(), "skipping non-id file"),
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Histogram of leaf occupancy: files in a leaf mapped to how many leaves
    /// hold that many. Diagnostic only.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if a directory cannot be listed.
    pub fn files_per_directory(&self) -> Result<BTreeMap<usize, usize>> {
        let mut histogram = BTreeMap::new();
        for leaf in self.leaf_dirs()? {
            let count = read_dir(&leaf)?.len();
            *histogram.entry(count).or_insert(0) += 1;
        }
        Ok(histogram)
    }

    /// Existing leaf directories.
    fn leaf_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut frontier = vec![self.root.clone()];
        for _ in 0..self.levels {
            let mut next = Vec::new();
            for dir in frontier {
                for entry in read_dir(&dir)? {
                    let is_bin = entry
                        .file_name()
                        .to_str()
                        .is_some_and(|n| n.starts_with(BIN_PREFIX));
                    if is_bin && entry.path().is_dir() {
                        next.push(entry.path());
                    }
                }
            }
            frontier = next;
        }
        Ok(frontier)
    }

    /// Removes every file and bin directory of the tree.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if removal fails.
    pub fn delete(&self) -> Result<()> {
        for entry in read_dir(&self.root)? {
            let is_bin = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(BIN_PREFIX));
            if is_bin {
                let path = entry.path();
                fs::remove_dir_all(&path).map_err(|e| StorageError::io(path, e))?;
            }
        }
        Ok(())
    }
}

fn read_dir(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| StorageError::io(dir, e).into()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StorageError::io(dir, e).into()),
    }
}

/// `create_dir_all` retried on errors a concurrent creator can cause.
pub(crate) fn create_dir_retrying(dir: &Path) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fs::create_dir_all(dir) {
            Ok(()) => return Ok(()),
            Err(e)
                if attempt < MKDIR_ATTEMPTS
                    && matches!(
                        e.kind(),
                        ErrorKind::Interrupted | ErrorKind::AlreadyExists | ErrorKind::NotFound
                    ) =>
            {
                warn!(dir = %dir.display(), attempt, error = %e, "retrying directory creation");
            }
            Err(e) => return Err(StorageError::io(dir, e).into()),
        }
    }
}

/// 64-bit FNV-1a. Stable across platforms and releases.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-' | b'+' | b'@' | b'=' | b',')
}

fn encode_file_name(id: &str) -> String {
    let mut out = String::with_capacity(id.len() + 8);
    for b in id.bytes() {
        if is_plain(b) {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn decode_file_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = name.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b if is_plain(b) => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}

/// Opens the hash rooted at `dir` from its `hash.json`. Without one, sizes
/// and records a new hash if `create` is set.
///
/// # Errors
///
/// Returns [`StorageError::CorruptState`] if a completed `hash.json` is
/// unusable and [`StorageError::Io`] on filesystem failures.
pub fn load_or_create(
    dir: &Path,
    files_per_store: u64,
    max_files_per_dir: u32,
    create: bool,
) -> Result<Option<DirectoryHash>> {
    let config_path = dir.join(HASH_CONFIG_FILE);
    let existing = match fs::read_to_string(&config_path) {
        Ok(text) => read_hash_config(&config_path, &text)?,
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(StorageError::io(config_path, e).into()),
    };

    let hash = match existing {
        Some(config) => DirectoryHash::open(dir, config.bins, config.levels, config.max_files_per_dir)
            .map_err(|e| StorageError::corrupt(&config_path, e.to_string()))?,
        None if !create => return Ok(None),
        None => {
            let hash = DirectoryHash::create(files_per_store, max_files_per_dir, dir)?;
            let config = HashConfig {
                bins: hash.bins,
                levels: hash.levels,
                max_files_per_dir: hash.max_files_per_dir,
                ok: true,
            };
            let json = serde_json::to_vec_pretty(&config)
                .map_err(|e| StorageError::corrupt(&config_path, e.to_string()))?;
            write_replace(&config_path, &json)?;
            hash
        }
    };
    Ok(Some(hash))
}

/// Parses `hash.json`. Text that never got its `"ok": true` is an
/// interrupted write and yields `None`; a finished file that does not decode
/// is corrupt.
fn read_hash_config(path: &Path, text: &str) -> Result<Option<HashConfig>> {
    let finished = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("ok").and_then(serde_json::Value::as_bool))
        .unwrap_or(false);
    if !finished {
        warn!(path = %path.display(), "found unfinished directory hash config, rebuilding");
        return Ok(None);
    }
    serde_json::from_str::<HashConfig>(text)
        .map(Some)
        .map_err(|e| StorageError::corrupt(path, format!("finished hash config does not decode: {e}")).into())
}

/// Persisted geometry of one directory hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct HashConfig {
    bins: u32,
    levels: u32,
    max_files_per_dir: u32,
    /// Set once the file is completely written.
    ok: bool,
}

/// Hands out one [`DirectoryHash`] per id path, persisting each hash's
/// geometry in `hash.json` so reopening finds the same placements.
#[derive(Debug)]
pub struct DirectoryHashFactory {
    type_dir: String,
    placement: PlacementConfig,
    files_per_store: u64,
    max_files_per_dir: u32,
    hashes: Mutex<HashMap<String, Arc<DirectoryHash>>>,
}

impl DirectoryHashFactory {
    /// Creates a factory placing hashes under `<root>/<type_dir>/<id path>`.
    pub fn new(
        type_dir: &str,
        placement: PlacementConfig,
        files_per_store: u64,
        max_files_per_dir: u32,
    ) -> Self {
        Self {
            type_dir: type_dir.to_string(),
            placement,
            files_per_store,
            max_files_per_dir,
            hashes: Mutex::new(HashMap::new()),
        }
    }

    fn store_dir(&self, id: &FsId) -> PathBuf {
        let mut dir = self.placement.root_for(id).join(&self.type_dir);
        dir.extend(id.path().split('/').filter(|s| !s.is_empty()));
        dir
    }

    /// The hash for `id`'s path. Without `create`, returns `None` if no hash
    /// has been written there yet.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptState`] if a completed `hash.json` is
    /// unusable and [`StorageError::Io`] on filesystem failures.
    pub fn find_dir_hash(&self, id: &FsId, create: bool) -> Result<Option<Arc<DirectoryHash>>> {
        let mut hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hash) = hashes.get(id.path()) {
            return Ok(Some(Arc::clone(hash)));
        }

        let dir = self.store_dir(id);
        let Some(hash) = load_or_create(&dir, self.files_per_store, self.max_files_per_dir, create)? else {
            return Ok(None);
        };
        let hash = Arc::new(hash);
        hashes.insert(id.path().to_string(), Arc::clone(&hash));
        Ok(Some(hash))
    }

    /// Id paths of every hash on disk whose path could hold ids starting
    /// with `prefix`, with their hashes.
    ///
    /// # Errors
    ///
    /// Same as [`DirectoryHashFactory::find_dir_hash`].
    pub fn hashes_under(&self, prefix: &str) -> Result<Vec<Arc<DirectoryHash>>> {
        let mut found = Vec::new();
        for root in self.placement.roots() {
            let base = root.join(&self.type_dir);
            let mut stack = vec![(base, String::from("/"))];
            while let Some((dir, id_path)) = stack.pop() {
                let relevant = id_path.starts_with(prefix) || prefix.starts_with(&id_path);
                if !relevant {
                    continue;
                }
                if dir.join(HASH_CONFIG_FILE).is_file() {
                    // Any name completes the path; only the path is consulted.
                    let marker = FsId::from_parts(&id_path, "_")?;
                    if let Some(hash) = self.find_dir_hash(&marker, false)? {
                        found.push(hash);
                    }
                }
                for entry in read_dir(&dir)? {
                    let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if name.starts_with(BIN_PREFIX) || !entry.path().is_dir() {
                        continue;
                    }
                    stack.push((entry.path(), format!("{id_path}{name}/")));
                }
            }
        }
        Ok(found)
    }

    /// Forgets cached hashes. The next lookup rereads `hash.json`.
    pub fn clear(&self) {
        self.hashes.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
