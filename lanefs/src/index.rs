//! Persistent mapping from ids to their storage lanes.
//!
//! The [`LocationIndex`] is an ordered map held in memory. Each flush appends
//! only the entries that changed to a delta log; once the log holds more
//! records than the index has entries, it is folded into a checksummed
//! snapshot and started afresh. Entries start as [`EntryState::New`] when a
//! transaction first writes an id and become [`EntryState::Persistent`] when
//! that transaction commits. Recovery drops every entry still `New`.
//!
//! # Snapshot format
//!
//! ```text
//! [0..4)    magic "LNIX"
//! [4..8)    version (u32 LE)
//! [8..16)   generation (u64 LE)
//! [16..24)  entry count (u64 LE)
//! entries   id (FsId binary form), file u64, lane u32, offset u64, state u8
//! [-4..)    CRC32 of everything before it
//! ```
//!
//! # Log format
//!
//! ```text
//! [0..4)    magic "LNIL"
//! [4..12)   generation (u64 LE), equal to the snapshot's
//! records   len u32 LE | crc32 u32 LE | payload
//! payload   op u8 (0 remove, 1 put), id, and for a put the location fields
//! ```
//!
//! A log whose generation is older than the snapshot's was already folded
//! in and is discarded. A torn record at the tail is cut off.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::allocator::{LaneAllocator, LaneAssignment};
use crate::error::{Result, StorageError};
use crate::id::{FsId, PathInterner};
use crate::mapped::{ExclusiveMapping, SharedMapping};
use crate::sequence::{sync_parent, write_replace};

const SNAPSHOT_MAGIC: [u8; 4] = *b"LNIX";
const LOG_MAGIC: [u8; 4] = *b"LNIL";
const INDEX_VERSION: u32 = 1;
const SNAPSHOT_FILE: &str = "locations.snap";
const LOG_FILE: &str = "locations.log";
const LANE_SEQUENCE_FILE: &str = "lanes.seq";
const SNAPSHOT_HEADER: usize = 24;
const LOG_HEADER: usize = 12;

/// Log records always tolerated before compaction, however small the index.
const COMPACT_MIN_RECORDS: u64 = 4096;

const OP_REMOVE: u8 = 0;
const OP_PUT: u8 = 1;

/// Lifecycle of an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    /// Allocated by an uncommitted transaction.
    New,
    /// Committed and visible to every reader.
    Persistent,
}

/// Physical location of one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Container file and lane.
    pub assignment: LaneAssignment,
    /// Byte offset of the id's data within the lane.
    pub offset: u64,
    /// Entry state.
    pub state: EntryState,
}

/// One lookup in a batch, tagged with the caller's ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedRequest {
    /// The id to locate.
    pub id: FsId,
    /// Caller-assigned position used to reassemble results.
    pub original_order: usize,
}

/// Result of one [`OrderedRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationResult {
    /// The id that was looked up.
    pub id: FsId,
    /// Copied from the request.
    pub original_order: usize,
    /// `None` if the id has no storage.
    pub location: Option<Location>,
}

impl LocationResult {
    /// `true` if the id has storage.
    pub fn exists(&self) -> bool {
        self.location.is_some()
    }
}

#[derive(Debug, Default)]
struct IndexState {
    entries: BTreeMap<FsId, Location>,
    /// Entries changed since the last flush; `None` records a removal.
    changes: BTreeMap<FsId, Option<Location>>,
}

impl IndexState {
    fn put(&mut self, id: FsId, location: Location) {
        self.changes.insert(id.clone(), Some(location));
        self.entries.insert(id, location);
    }

    fn remove(&mut self, id: &FsId) -> bool {
        match self.entries.remove_entry(id) {
            Some((id, _)) => {
                self.changes.insert(id, None);
                true
            }
            None => false,
        }
    }
}

/// Append handle on the delta log.
#[derive(Debug)]
struct DeltaLog {
    path: PathBuf,
    file: File,
    len: u64,
    records: u64,
}

impl DeltaLog {
    /// Replaces the log at `path` with an empty one of `generation`.
    fn create(path: &Path, generation: u64) -> Result<Self> {
        let mut header = Vec::with_capacity(LOG_HEADER);
        header.extend_from_slice(&LOG_MAGIC);
        header.extend_from_slice(&generation.to_le_bytes());
        write_replace(path, &header)?;
        Self::open(path, LOG_HEADER as u64, 0)
    }

    /// Opens the log for appending after its first `len` bytes, dropping
    /// whatever follows them.
    fn open(path: &Path, len: u64, records: u64) -> Result<Self> {
        let io = |e| StorageError::io(path, e);
        let file = OpenOptions::new().write(true).open(path).map_err(io)?;
        if file.metadata().map_err(io)?.len() != len {
            file.set_len(len).map_err(io)?;
            file.sync_data().map_err(io)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
            records,
        })
    }

    fn append(&mut self, changes: &BTreeMap<FsId, Option<Location>>) -> Result<()> {
        let mut batch = Vec::with_capacity(changes.len() * 64);
        for (id, change) in changes {
            encode_change(&mut batch, id, *change)?;
        }
        let written = self
            .file
            .seek(SeekFrom::Start(self.len))
            .and_then(|_| self.file.write_all(&batch))
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            // Cut a partial batch so the records after it stay reachable.
            if let Err(cut) = self.file.set_len(self.len) {
                warn!(path = %self.path.display(), error = %cut, "could not cut failed index log append");
            }
            return Err(StorageError::io(&self.path, e).into());
        }
        self.len += batch.len() as u64;
        self.records += changes.len() as u64;
        Ok(())
    }
}

/// Flush-side state, held across log and snapshot writes.
#[derive(Debug)]
struct Durable {
    /// Generation of the snapshot on disk, carried by the live log.
    generation: u64,
    /// `None` after a failed append or reset; the next flush compacts.
    log: Option<DeltaLog>,
}

/// The durable id → lane map of one storage root.
#[derive(Debug)]
pub struct LocationIndex {
    snapshot_path: PathBuf,
    log_path: PathBuf,
    allocator: LaneAllocator,
    /// Shares the path of every id the index holds.
    paths: PathInterner,
    state: Mutex<IndexState>,
    /// Serializes flushes so appends and compactions never interleave.
    durable: Mutex<Durable>,
    compact_min: u64,
}

impl LocationIndex {
    /// Opens the index stored in `dir`, creating an empty one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptState`] if the snapshot fails its
    /// checksum or does not parse, or the log header is damaged.
    pub fn open(dir: &Path, lanes_per_file: u32, sequence_reserve: u64) -> Result<Self> {
        crate::dirhash::create_dir_retrying(dir)?;
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let log_path = dir.join(LOG_FILE);
        let paths = PathInterner::new();
        let (generation, mut entries) = if snapshot_path.exists() {
            let mapping = SharedMapping::open(&snapshot_path)?;
            decode_snapshot(&paths, mapping.path(), mapping.as_slice())?
        } else {
            (0, BTreeMap::new())
        };
        let log = replay_log(&paths, &log_path, generation, &mut entries)?;
        debug!(
            path = %snapshot_path.display(),
            entries = entries.len(),
            generation,
            log_records = log.records,
            "opened location index"
        );
        Ok(Self {
            snapshot_path,
            log_path,
            allocator: LaneAllocator::open(&dir.join(LANE_SEQUENCE_FILE), lanes_per_file, sequence_reserve)?,
            paths,
            state: Mutex::new(IndexState {
                entries,
                changes: BTreeMap::new(),
            }),
            durable: Mutex::new(Durable {
                generation,
                log: Some(log),
            }),
            compact_min: COMPACT_MIN_RECORDS,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The location of `id`. With `create_if_absent`, allocates a fresh
    /// lane and records it as [`EntryState::New`].
    ///
    /// # Errors
    ///
    /// Returns an error if lane allocation fails.
    pub fn storage_for(&self, id: &FsId, create_if_absent: bool) -> Result<Option<Location>> {
        if let Some(location) = self.lock().entries.get(id) {
            return Ok(Some(*location));
        }
        if !create_if_absent {
            return Ok(None);
        }
        // Allocate outside the structural lock; a lost race orphans one lane.
        let assignment = self.allocator.allocate_lane()?;
        let shared = self.paths.share(id);
        let mut state = self.lock();
        if let Some(location) = state.entries.get(id) {
            return Ok(Some(*location));
        }
        let location = Location {
            assignment,
            offset: 0,
            state: EntryState::New,
        };
        state.put(shared, location);
        debug!(%id, file = assignment.file, lane = assignment.lane, "allocated storage");
        Ok(Some(location))
    }

    /// A fresh `New` lane that no entry points to yet. Committing a write to
    /// it records it with [`LocationIndex::insert`]; otherwise it is
    /// orphaned.
    ///
    /// # Errors
    ///
    /// Returns an error if lane allocation fails.
    pub fn allocate_detached(&self) -> Result<Location> {
        Ok(Location {
            assignment: self.allocator.allocate_lane()?,
            offset: 0,
            state: EntryState::New,
        })
    }

    /// Records a known location, as recovery does when replaying a journal.
    pub fn insert(&self, id: &FsId, location: Location) {
        let shared = self.paths.share(id);
        self.lock().put(shared, location);
    }

    /// Moves each id from `New` to `Persistent`.
    pub fn mark_persistent<'a>(&self, ids: impl IntoIterator<Item = &'a FsId>) {
        let mut state = self.lock();
        for id in ids {
            let promoted = match state.entries.get_key_value(id) {
                Some((key, location)) if location.state == EntryState::New => Some((key.clone(), *location)),
                _ => None,
            };
            if let Some((key, location)) = promoted {
                state.put(
                    key,
                    Location {
                        state: EntryState::Persistent,
                        ..location
                    },
                );
            }
        }
    }

    /// Removes `id`. Its bytes are orphaned, not reused.
    pub fn remove_id(&self, id: &FsId) -> bool {
        self.lock().remove(id)
    }

    /// Removes each id that is still `New`, returning how many were removed.
    pub fn remove_all_new_ids<'a>(&self, ids: impl IntoIterator<Item = &'a FsId>) -> usize {
        let mut state = self.lock();
        let mut removed = 0;
        for id in ids {
            if state
                .entries
                .get(id)
                .is_some_and(|l| l.state == EntryState::New)
            {
                state.remove(id);
                removed += 1;
            }
        }
        removed
    }

    /// Removes every `New` entry. Used by recovery.
    pub fn remove_every_new_id(&self) -> usize {
        let mut state = self.lock();
        let doomed: Vec<FsId> = state
            .entries
            .iter()
            .filter(|(_, l)| l.state == EntryState::New)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            state.remove(id);
        }
        doomed.len()
    }

    /// `true` if `id` has an entry in either state.
    pub fn is_allocated(&self, id: &FsId) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// Every persistent id, sorted.
    pub fn find_ids(&self) -> Vec<FsId> {
        self.find_ids_with_prefix("/")
    }

    /// Persistent ids whose string form starts with `prefix`, sorted.
    pub fn find_ids_with_prefix(&self, prefix: &str) -> Vec<FsId> {
        self.lock()
            .entries
            .iter()
            .filter(|(id, l)| l.state == EntryState::Persistent && id.has_prefix(prefix))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of entries in either state.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// `true` if the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a batch. Lookups run in id order for locality; each result
    /// keeps its request's `original_order`, and results come back sorted by
    /// it.
    pub fn location_for(&self, mut requests: Vec<OrderedRequest>) -> Vec<LocationResult> {
        requests.sort_by(|a, b| a.id.cmp(&b.id));
        let mut results: Vec<LocationResult> = {
            let state = self.lock();
            requests
                .into_iter()
                .map(|r| LocationResult {
                    location: state.entries.get(&r.id).copied(),
                    id: r.id,
                    original_order: r.original_order,
                })
                .collect()
        };
        results.sort_by_key(|r| r.original_order);
        results
    }

    /// Makes every change since the last flush durable. Usually this appends
    /// the changed entries to the log; when the log has outgrown the index it
    /// is compacted into a new snapshot instead.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the log or snapshot cannot be written.
    /// The unflushed changes are kept for the next attempt.
    pub fn commit_pending_modifications(&self) -> Result<()> {
        let mut durable = self.durable.lock().unwrap_or_else(|e| e.into_inner());
        let (changes, threshold) = {
            let mut state = self.lock();
            if state.changes.is_empty() {
                return Ok(());
            }
            let threshold = (state.entries.len() as u64).max(self.compact_min);
            (std::mem::take(&mut state.changes), threshold)
        };

        let result = match durable.log.take() {
            Some(mut log) if log.records + changes.len() as u64 <= threshold => {
                let appended = log.append(&changes);
                if appended.is_ok() {
                    durable.log = Some(log);
                }
                appended
            }
            _ => self.compact(&mut durable),
        };
        if result.is_err() {
            let mut state = self.lock();
            for (id, change) in changes {
                state.changes.entry(id).or_insert(change);
            }
        }
        result
    }

    /// Writes every entry to a snapshot of the next generation, then starts
    /// an empty log of that generation.
    fn compact(&self, durable: &mut Durable) -> Result<()> {
        let entries: Vec<(FsId, Location)> = self.lock().entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
        let generation = durable.generation + 1;
        write_snapshot(&self.snapshot_path, generation, &entries)?;
        durable.generation = generation;
        durable.log = Some(DeltaLog::create(&self.log_path, generation)?);
        info!(
            path = %self.snapshot_path.display(),
            entries = entries.len(),
            generation,
            "compacted index log into snapshot"
        );
        Ok(())
    }
}

fn encode_location(out: &mut Vec<u8>, location: &Location) {
    out.extend_from_slice(&location.assignment.file.to_le_bytes());
    out.extend_from_slice(&location.assignment.lane.to_le_bytes());
    out.extend_from_slice(&location.offset.to_le_bytes());
    out.push(match location.state {
        EntryState::New => 0,
        EntryState::Persistent => 1,
    });
}

fn take_location(cursor: &mut &[u8]) -> std::result::Result<Location, String> {
    let truncated = || "truncated location".to_string();
    let file = take_u64(cursor).ok_or_else(truncated)?;
    let lane = take_u32(cursor).ok_or_else(truncated)?;
    let offset = take_u64(cursor).ok_or_else(truncated)?;
    let (&state, rest) = cursor.split_first().ok_or_else(truncated)?;
    *cursor = rest;
    let state = match state {
        0 => EntryState::New,
        1 => EntryState::Persistent,
        other => return Err(format!("state byte {other}")),
    };
    Ok(Location {
        assignment: LaneAssignment { file, lane },
        offset,
        state,
    })
}

fn encode_change(out: &mut Vec<u8>, id: &FsId, change: Option<Location>) -> Result<()> {
    let mut payload = Vec::with_capacity(id.encoded_len() + 22);
    match change {
        None => {
            payload.push(OP_REMOVE);
            id.write_to(&mut payload)?;
        }
        Some(location) => {
            payload.push(OP_PUT);
            id.write_to(&mut payload)?;
            encode_location(&mut payload, &location);
        }
    }
    #[allow(clippy::cast_possible_truncation)] // an id is at most two u16-length components
    let len = payload.len() as u32;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(())
}

fn decode_change(paths: &PathInterner, payload: &[u8]) -> std::result::Result<(FsId, Option<Location>), String> {
    let (&op, rest) = payload.split_first().ok_or_else(|| "empty record".to_string())?;
    let (id, used) = paths.decode(rest).map_err(|e| e.to_string())?;
    let mut cursor = &rest[used..];
    let change = match op {
        OP_REMOVE => None,
        OP_PUT => Some(take_location(&mut cursor)?),
        other => return Err(format!("unknown op {other}")),
    };
    if !cursor.is_empty() {
        return Err(format!("{} trailing bytes", cursor.len()));
    }
    Ok((id, change))
}

/// Splits one `len | crc | payload` frame off the front of `buf`, returning
/// the crc, the payload, and the rest. `None` if the frame is cut short.
fn split_frame(buf: &[u8]) -> Option<(u32, &[u8], &[u8])> {
    let mut cursor = buf;
    let len = usize::try_from(take_u32(&mut cursor)?).ok()?;
    let crc = take_u32(&mut cursor)?;
    if cursor.len() < len {
        return None;
    }
    let (payload, rest) = cursor.split_at(len);
    Some((crc, payload, rest))
}

/// Applies the log at `path` to `entries` and opens it for appending.
fn replay_log(
    paths: &PathInterner,
    path: &Path,
    generation: u64,
    entries: &mut BTreeMap<FsId, Location>,
) -> Result<DeltaLog> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return DeltaLog::create(path, generation),
        Err(e) => return Err(StorageError::io(path, e).into()),
    };
    let corrupt = |reason: String| StorageError::corrupt(path, reason);
    let mut header = bytes.get(4..LOG_HEADER).unwrap_or_default();
    let logged = match take_u64(&mut header) {
        Some(logged) if bytes[..4] == LOG_MAGIC => logged,
        _ => return Err(corrupt("bad index log header".to_string()).into()),
    };
    if logged < generation {
        debug!(path = %path.display(), logged, generation, "discarding index log folded into snapshot");
        return DeltaLog::create(path, generation);
    }
    if logged > generation {
        return Err(corrupt(format!(
            "index log generation {logged} is ahead of snapshot generation {generation}"
        ))
        .into());
    }

    let mut cursor = &bytes[LOG_HEADER..];
    let mut records = 0u64;
    while let Some((crc, payload, rest)) = split_frame(cursor) {
        if crc32fast::hash(payload) != crc {
            break;
        }
        let (id, change) = decode_change(paths, payload).map_err(|e| corrupt(format!("log record {records}: {e}")))?;
        match change {
            Some(location) => entries.insert(id, location),
            None => entries.remove(&id),
        };
        records += 1;
        cursor = rest;
    }
    if !cursor.is_empty() {
        warn!(path = %path.display(), dropped = cursor.len(), records, "cutting torn tail off index log");
    }
    DeltaLog::open(path, (bytes.len() - cursor.len()) as u64, records)
}

fn write_snapshot(path: &Path, generation: u64, entries: &[(FsId, Location)]) -> Result<()> {
    let mut body = Vec::with_capacity(SNAPSHOT_HEADER + entries.len() * 48);
    body.extend_from_slice(&SNAPSHOT_MAGIC);
    body.extend_from_slice(&INDEX_VERSION.to_le_bytes());
    body.extend_from_slice(&generation.to_le_bytes());
    body.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for (id, location) in entries {
        id.write_to(&mut body)?;
        encode_location(&mut body, location);
    }
    let crc = crc32fast::hash(&body);
    body.extend_from_slice(&crc.to_le_bytes());

    let tmp = path.with_extension("snap.tmp~");
    let mut mapping = ExclusiveMapping::create(&tmp, body.len() as u64)?;
    mapping.as_mut_slice().copy_from_slice(&body);
    mapping.flush()?;
    fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;
    sync_parent(path)
}

fn decode_snapshot(paths: &PathInterner, path: &Path, bytes: &[u8]) -> Result<(u64, BTreeMap<FsId, Location>)> {
    let corrupt = |reason: String| StorageError::corrupt(path, reason);
    if bytes.len() < SNAPSHOT_HEADER + 4 {
        return Err(corrupt(format!("index snapshot too short: {} bytes", bytes.len())).into());
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32fast::hash(body) != stored {
        return Err(corrupt("index snapshot checksum mismatch".to_string()).into());
    }
    if body[0..4] != SNAPSHOT_MAGIC {
        return Err(corrupt(format!("invalid magic bytes {:?}", &body[0..4])).into());
    }
    let version = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    if version != INDEX_VERSION {
        return Err(corrupt(format!("unsupported index version {version}")).into());
    }

    let mut cursor = &body[8..];
    let generation = take_u64(&mut cursor).ok_or_else(|| corrupt("missing generation".to_string()))?;
    let count = take_u64(&mut cursor).ok_or_else(|| corrupt("missing entry count".to_string()))?;
    let mut entries = BTreeMap::new();
    for n in 0..count {
        let (id, used) = paths.decode(cursor).map_err(|e| corrupt(format!("entry {n}: {e}")))?;
        cursor = &cursor[used..];
        let location = take_location(&mut cursor).map_err(|e| corrupt(format!("entry {n}: {e}")))?;
        entries.insert(id, location);
    }
    if !cursor.is_empty() {
        return Err(corrupt(format!("{} trailing bytes after entries", cursor.len())).into());
    }
    Ok((generation, entries))
}

fn take_u64(cursor: &mut &[u8]) -> Option<u64> {
    let (head, rest) = cursor.split_first_chunk::<8>()?;
    *cursor = rest;
    Some(u64::from_le_bytes(*head))
}

fn take_u32(cursor: &mut &[u8]) -> Option<u32> {
    let (head, rest) = cursor.split_first_chunk::<4>()?;
    *cursor = rest;
    Some(u32::from_le_bytes(*head))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id(s: &str) -> FsId {
        FsId::parse(s).unwrap()
    }

    #[test]
    fn test_storage_for_allocates_once() {
        let dir = tempdir().unwrap();
        let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
        assert!(index.storage_for(&id("/a/1"), false).unwrap().is_none());

        let first = index.storage_for(&id("/a/1"), true).unwrap().unwrap();
        assert_eq!(first.state, EntryState::New);
        let again = index.storage_for(&id("/a/1"), true).unwrap().unwrap();
        assert_eq!(first, again);

        let other = index.storage_for(&id("/a/2"), true).unwrap().unwrap();
        assert_ne!(first.assignment, other.assignment);
        assert!(index.is_allocated(&id("/a/2")));
    }

    #[test]
    fn test_new_entries_hidden_until_persistent() {
        let dir = tempdir().unwrap();
        let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
        index.storage_for(&id("/a/1"), true).unwrap();
        index.storage_for(&id("/a/2"), true).unwrap();
        assert!(index.find_ids().is_empty());

        index.mark_persistent([&id("/a/1")]);
        assert_eq!(index.find_ids(), vec![id("/a/1")]);

        assert_eq!(index.remove_all_new_ids([&id("/a/1"), &id("/a/2")]), 1);
        assert!(index.is_allocated(&id("/a/1")));
        assert!(!index.is_allocated(&id("/a/2")));
    }

    #[test]
    fn test_location_for_preserves_original_order() {
        let dir = tempdir().unwrap();
        let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
        for s in ["/b/1", "/a/1"] {
            index.storage_for(&id(s), true).unwrap();
        }
        let requests = vec![
            OrderedRequest { id: id("/b/1"), original_order: 0 },
            OrderedRequest { id: id("/zz/missing"), original_order: 1 },
            OrderedRequest { id: id("/a/1"), original_order: 2 },
        ];
        let results = index.location_for(requests);
        let orders: Vec<usize> = results.iter().map(|r| r.original_order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
        assert_eq!(results[0].id, id("/b/1"));
        assert!(results[0].exists());
        assert!(!results[1].exists());
        assert!(results[2].exists());
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        let kept;
        {
            let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
            kept = index.storage_for(&id("/a/keep"), true).unwrap().unwrap();
            index.storage_for(&id("/a/gone"), true).unwrap();
            index.mark_persistent([&id("/a/keep"), &id("/a/gone")]);
            index.commit_pending_modifications().unwrap();
            index.remove_id(&id("/a/gone"));
            index.storage_for(&id("/a/pending"), true).unwrap();
            index.commit_pending_modifications().unwrap();
        }
        let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
        assert_eq!(index.find_ids(), vec![id("/a/keep")]);
        let reopened = index.storage_for(&id("/a/keep"), false).unwrap().unwrap();
        assert_eq!(reopened.assignment, kept.assignment);
        assert_eq!(reopened.state, EntryState::Persistent);

        assert_eq!(index.remove_every_new_id(), 1);
        assert!(!index.is_allocated(&id("/a/pending")));
    }

    #[test]
    fn test_uncommitted_changes_lost_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
            index.storage_for(&id("/a/1"), true).unwrap();
        }
        let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
        assert!(index.is_empty());
    }

    fn compact_now(index: &LocationIndex) {
        let mut durable = index.durable.lock().unwrap();
        index.compact(&mut durable).unwrap();
    }

    fn log_records(index: &LocationIndex) -> u64 {
        index.durable.lock().unwrap().log.as_ref().unwrap().records
    }

    #[test]
    fn test_corrupt_snapshot_detected() {
        let dir = tempdir().unwrap();
        {
            let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
            index.storage_for(&id("/a/1"), true).unwrap();
            index.commit_pending_modifications().unwrap();
            compact_now(&index);
        }
        let path = dir.path().join(SNAPSHOT_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        assert!(LocationIndex::open(dir.path(), 4, 10).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_prefix_search() {
        let dir = tempdir().unwrap();
        let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
        let ids = [id("/pa/flux/1"), id("/pa/flux/2"), id("/pa/cent/1"), id("/cal/x")];
        for i in &ids {
            index.storage_for(i, true).unwrap();
        }
        index.mark_persistent(ids.iter());
        assert_eq!(index.find_ids_with_prefix("/pa/flux/").len(), 2);
        assert_eq!(index.find_ids_with_prefix("/pa/").len(), 3);
        assert_eq!(index.find_ids().len(), 4);
    }

    #[test]
    fn test_flush_appends_only_changed_entries() {
        let dir = tempdir().unwrap();
        let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
        let ids: Vec<FsId> = (0..300).map(|i| id(&format!("/pa/bulk/{i:04}"))).collect();
        for i in &ids {
            index.storage_for(i, true).unwrap();
        }
        index.mark_persistent(ids.iter());
        index.commit_pending_modifications().unwrap();
        assert_eq!(log_records(&index), 300);

        let log_path = dir.path().join(LOG_FILE);
        let mut sizes = vec![fs::metadata(&log_path).unwrap().len()];
        for i in 0..20 {
            let single = id(&format!("/pa/one/{i:04}"));
            index.storage_for(&single, true).unwrap();
            index.commit_pending_modifications().unwrap();
            sizes.push(fs::metadata(&log_path).unwrap().len());
        }
        // One record per flush, the same size for same-length ids, and no
        // snapshot rewrite.
        let growth: Vec<u64> = sizes.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(growth.iter().all(|g| *g == growth[0]));
        assert!(growth[0] < 64);
        assert!(!dir.path().join(SNAPSHOT_FILE).exists());

        // Nothing changed, nothing written.
        index.commit_pending_modifications().unwrap();
        assert_eq!(fs::metadata(&log_path).unwrap().len(), sizes[20]);
    }

    #[test]
    fn test_log_compacts_into_snapshot() {
        let dir = tempdir().unwrap();
        {
            let mut index = LocationIndex::open(dir.path(), 4, 10).unwrap();
            index.compact_min = 8;
            for i in 0..40 {
                let target = id(&format!("/pa/churn/{i}"));
                index.storage_for(&target, true).unwrap();
                index.mark_persistent([&target]);
                index.commit_pending_modifications().unwrap();
                assert!(log_records(&index) <= (index.len() as u64).max(8));
            }
            for i in 0..10 {
                index.remove_id(&id(&format!("/pa/churn/{i}")));
                index.commit_pending_modifications().unwrap();
            }
            assert!(index.durable.lock().unwrap().generation > 0);
        }
        assert!(dir.path().join(SNAPSHOT_FILE).exists());
        let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
        let found = index.find_ids_with_prefix("/pa/churn/");
        assert_eq!(found.len(), 30);
        assert!(!index.is_allocated(&id("/pa/churn/3")));
        assert!(index.is_allocated(&id("/pa/churn/33")));
    }

    #[test]
    fn test_torn_log_tail_is_cut() {
        let dir = tempdir().unwrap();
        {
            let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
            for name in ["/a/1", "/a/2", "/a/3"] {
                index.storage_for(&id(name), true).unwrap();
                index.mark_persistent([&id(name)]);
                index.commit_pending_modifications().unwrap();
            }
        }
        let log_path = dir.path().join(LOG_FILE);
        let good_len = fs::metadata(&log_path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[40, 0, 0, 0, 1, 2, 3, 4, OP_PUT, 3]).unwrap();
        drop(file);

        {
            let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
            assert_eq!(index.find_ids().len(), 3);
            assert_eq!(fs::metadata(&log_path).unwrap().len(), good_len);
            index.storage_for(&id("/a/4"), true).unwrap();
            index.mark_persistent([&id("/a/4")]);
            index.commit_pending_modifications().unwrap();
        }
        let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
        assert_eq!(index.find_ids().len(), 4);
    }

    #[test]
    fn test_log_older_than_snapshot_is_ignored() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join(LOG_FILE);
        let stale;
        {
            let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
            index.storage_for(&id("/a/doomed"), true).unwrap();
            index.mark_persistent([&id("/a/doomed")]);
            index.commit_pending_modifications().unwrap();
            stale = fs::read(&log_path).unwrap();

            index.remove_id(&id("/a/doomed"));
            index.storage_for(&id("/a/kept"), true).unwrap();
            index.commit_pending_modifications().unwrap();
            compact_now(&index);
        }
        // A crash between writing the snapshot and resetting the log leaves
        // the old log behind.
        fs::write(&log_path, &stale).unwrap();
        let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
        assert!(!index.is_allocated(&id("/a/doomed")));
        assert!(index.is_allocated(&id("/a/kept")));
        assert_eq!(log_records(&index), 0);
    }

    #[test]
    fn test_reopened_ids_share_paths() {
        let dir = tempdir().unwrap();
        {
            let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
            let ids = [id("/pa/flux/1"), id("/pa/flux/2"), id("/pa/cent/1")];
            for i in &ids {
                index.storage_for(i, true).unwrap();
            }
            index.mark_persistent(ids.iter());
            index.commit_pending_modifications().unwrap();
            let held = index.find_ids();
            assert!(held[1].shares_path_with(&held[2]));
        }
        let index = LocationIndex::open(dir.path(), 4, 10).unwrap();
        let found = index.find_ids();
        assert_eq!(found.len(), 3);
        assert!(found[1].shares_path_with(&found[2]));
        assert!(!found[0].shares_path_with(&found[1]));
    }
}
