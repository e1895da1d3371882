//! Redo journal and status log of one transaction.
//!
//! Preparing a transaction writes every change it made to a journal file as
//! a sequence of checksummed records, fsyncs it, then records the
//! transaction as `Prepared` in a small JSON status log. Committing flips the
//! log to `Committing` before touching any container; that flip is the
//! durable commit point. After a crash, a journal whose log says
//! `Committing` is replayed and every other journal is discarded.
//!
//! # Journal format
//!
//! ```text
//! [0..4)   magic "LNJR"
//! [4..6)   version (u16 LE)
//! records  len u32 LE | crc32 u32 LE | payload (len bytes)
//! ```
//!
//! Each payload starts with a record tag byte.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::allocator::LaneAssignment;
use crate::error::{CodecError, FsError, Result, StorageError};
use crate::id::FsId;
use crate::interval::{read_i64, read_u32, read_u64, Interval, IntervalSet, TaggedInterval};
use crate::sequence::{sync_parent, write_replace};
use crate::series::DataType;

const JOURNAL_MAGIC: [u8; 4] = *b"LNJR";
const JOURNAL_VERSION: u16 = 1;

/// Largest payload accepted when reading a record back.
const MAX_RECORD_LEN: u32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordTag {
    SeriesWrite = 1,
    SeriesMeta = 2,
    SeriesDelete = 3,
    BlobPut = 4,
    BlobDelete = 5,
    MjdPut = 6,
    MjdDelete = 7,
}

/// One redo step.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    /// Raw values written into a series lane starting at `position`.
    SeriesWrite {
        /// Series id.
        id: FsId,
        /// Lane holding the series.
        assignment: LaneAssignment,
        /// Element type of `bytes`.
        data_type: DataType,
        /// Position of the first value.
        position: i64,
        /// Little-endian values.
        bytes: Vec<u8>,
    },
    /// Final metadata of a series after the transaction.
    SeriesMeta {
        /// Series id.
        id: FsId,
        /// Lane holding the series.
        assignment: LaneAssignment,
        /// Element type.
        data_type: DataType,
        /// Valid positions.
        valid: IntervalSet<Interval>,
        /// Originators of the valid positions.
        originators: IntervalSet<TaggedInterval>,
    },
    /// The series is removed.
    SeriesDelete {
        /// Series id.
        id: FsId,
    },
    /// The blob is replaced.
    BlobPut {
        /// Blob id.
        id: FsId,
        /// Originator tag.
        origin: u64,
        /// New contents.
        bytes: Vec<u8>,
    },
    /// The blob is removed.
    BlobDelete {
        /// Blob id.
        id: FsId,
    },
    /// Every point of an irregularly sampled series is replaced.
    MjdPut {
        /// Series id.
        id: FsId,
        /// The stored point set.
        bytes: Vec<u8>,
    },
    /// The irregularly sampled series is removed.
    MjdDelete {
        /// Series id.
        id: FsId,
    },
}

impl JournalRecord {
    /// The id the record changes.
    pub fn id(&self) -> &FsId {
        match self {
            JournalRecord::SeriesWrite { id, .. }
            | JournalRecord::SeriesMeta { id, .. }
            | JournalRecord::SeriesDelete { id }
            | JournalRecord::BlobPut { id, .. }
            | JournalRecord::BlobDelete { id }
            | JournalRecord::MjdPut { id, .. }
            | JournalRecord::MjdDelete { id } => id,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            JournalRecord::SeriesWrite {
                id,
                assignment,
                data_type,
                position,
                bytes,
            } => {
                out.push(RecordTag::SeriesWrite as u8);
                id.write_to(&mut out)?;
                put_assignment(&mut out, *assignment);
                out.push(data_type.code());
                out.extend_from_slice(&position.to_le_bytes());
                put_bytes(&mut out, bytes);
            }
            JournalRecord::SeriesMeta {
                id,
                assignment,
                data_type,
                valid,
                originators,
            } => {
                out.push(RecordTag::SeriesMeta as u8);
                id.write_to(&mut out)?;
                put_assignment(&mut out, *assignment);
                out.push(data_type.code());
                valid.write_to(&mut out)?;
                originators.write_to(&mut out)?;
            }
            JournalRecord::SeriesDelete { id } => {
                out.push(RecordTag::SeriesDelete as u8);
                id.write_to(&mut out)?;
            }
            JournalRecord::BlobPut { id, origin, bytes } => {
                out.push(RecordTag::BlobPut as u8);
                id.write_to(&mut out)?;
                out.extend_from_slice(&origin.to_le_bytes());
                put_bytes(&mut out, bytes);
            }
            JournalRecord::BlobDelete { id } => {
                out.push(RecordTag::BlobDelete as u8);
                id.write_to(&mut out)?;
            }
            JournalRecord::MjdPut { id, bytes } => {
                out.push(RecordTag::MjdPut as u8);
                id.write_to(&mut out)?;
                put_bytes(&mut out, bytes);
            }
            JournalRecord::MjdDelete { id } => {
                out.push(RecordTag::MjdDelete as u8);
                id.write_to(&mut out)?;
            }
        }
        Ok(out)
    }

    fn decode(mut payload: &[u8]) -> Result<Self> {
        let input = &mut payload;
        let tag = read_u8(input)?;
        let id = FsId::read_from(input)?;
        let record = match tag {
            t if t == RecordTag::SeriesWrite as u8 => JournalRecord::SeriesWrite {
                id,
                assignment: read_assignment(input)?,
                data_type: read_data_type(input)?,
                position: read_i64(input)?,
                bytes: read_bytes(input)?,
            },
            t if t == RecordTag::SeriesMeta as u8 => JournalRecord::SeriesMeta {
                id,
                assignment: read_assignment(input)?,
                data_type: read_data_type(input)?,
                valid: IntervalSet::read_from(input)?,
                originators: IntervalSet::read_from(input)?,
            },
            t if t == RecordTag::SeriesDelete as u8 => JournalRecord::SeriesDelete { id },
            t if t == RecordTag::BlobPut as u8 => JournalRecord::BlobPut {
                id,
                origin: read_u64(input)?,
                bytes: read_bytes(input)?,
            },
            t if t == RecordTag::BlobDelete as u8 => JournalRecord::BlobDelete { id },
            t if t == RecordTag::MjdPut as u8 => JournalRecord::MjdPut {
                id,
                bytes: read_bytes(input)?,
            },
            t if t == RecordTag::MjdDelete as u8 => JournalRecord::MjdDelete { id },
            other => {
                return Err(CodecError::Frame {
                    reason: format!("unknown journal record tag {other}"),
                }
                .into());
            }
        };
        if !input.is_empty() {
            return Err(CodecError::Frame {
                reason: format!("{} trailing bytes after journal record", input.len()),
            }
            .into());
        }
        Ok(record)
    }
}

fn put_assignment(out: &mut Vec<u8>, assignment: LaneAssignment) {
    out.extend_from_slice(&assignment.file.to_le_bytes());
    out.extend_from_slice(&assignment.lane.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn read_u8<R: Read>(input: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf).map_err(CodecError::Stream)?;
    Ok(buf[0])
}

fn read_assignment<R: Read>(input: &mut R) -> Result<LaneAssignment> {
    Ok(LaneAssignment {
        file: read_u64(input)?,
        lane: read_u32(input)?,
    })
}

fn read_data_type<R: Read>(input: &mut R) -> Result<DataType> {
    let code = read_u8(input)?;
    DataType::from_code(code).ok_or_else(|| {
        CodecError::Frame {
            reason: format!("unknown data type code {code}"),
        }
        .into()
    })
}

fn read_bytes(input: &mut &[u8]) -> Result<Vec<u8>> {
    let len = read_u64(input)?;
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= input.len())
        .ok_or_else(|| CodecError::Frame {
            reason: format!("byte field of {len} overruns record"),
        })?;
    let (bytes, rest) = input.split_at(len);
    *input = rest;
    Ok(bytes.to_vec())
}

/// Appends records to a new journal file.
#[derive(Debug)]
pub struct JournalWriter {
    path: PathBuf,
    out: BufWriter<File>,
    records: usize,
}

impl JournalWriter {
    /// Creates `path`, replacing any stale journal there.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be created.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| StorageError::io(path, e))?;
        let mut out = BufWriter::new(file);
        out.write_all(&JOURNAL_MAGIC).map_err(|e| StorageError::io(path, e))?;
        out.write_all(&JOURNAL_VERSION.to_le_bytes())
            .map_err(|e| StorageError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            out,
            records: 0,
        })
    }

    /// Appends one framed record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on write failure and [`CodecError::Frame`]
    /// if the record is too large to frame.
    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let payload = record.encode()?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_LEN)
            .ok_or_else(|| CodecError::Frame {
                reason: format!("journal record of {} bytes is too large", payload.len()),
            })?;
        let crc = crc32fast::hash(&payload);
        let path = &self.path;
        self.out.write_all(&len.to_le_bytes()).map_err(|e| StorageError::io(path, e))?;
        self.out.write_all(&crc.to_le_bytes()).map_err(|e| StorageError::io(path, e))?;
        self.out.write_all(&payload).map_err(|e| StorageError::io(path, e))?;
        self.records += 1;
        Ok(())
    }

    /// Flushes and fsyncs the journal, making it durable.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the flush or fsync fails.
    pub fn finish(self) -> Result<()> {
        let path = self.path;
        let file = self
            .out
            .into_inner()
            .map_err(|e| StorageError::io(&path, e.into_error()))?;
        file.sync_all().map_err(|e| StorageError::io(&path, e))?;
        sync_parent(&path)?;
        debug!(path = %path.display(), records = self.records, "journal durable");
        Ok(())
    }
}

/// Reads every record of a complete journal.
///
/// The journal was fsynced before its transaction could commit, so any
/// damage is reported rather than treated as a torn tail.
///
/// # Errors
///
/// Returns [`StorageError::CorruptState`] on a bad header, checksum, or
/// record, and [`StorageError::Io`] if the file cannot be read.
pub fn read_journal(path: &Path) -> Result<Vec<JournalRecord>> {
    let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
    let mut input = BufReader::new(file);
    let corrupt = |reason: String| -> FsError { StorageError::corrupt(path, reason).into() };

    let mut header = [0u8; 6];
    input
        .read_exact(&mut header)
        .map_err(|e| corrupt(format!("short journal header: {e}")))?;
    if header[..4] != JOURNAL_MAGIC {
        return Err(corrupt("bad journal magic".to_string()));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != JOURNAL_VERSION {
        return Err(corrupt(format!("unsupported journal version {version}")));
    }

    let mut records = Vec::new();
    loop {
        let mut frame = [0u8; 8];
        match input.read_exact(&mut frame[..1]) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(StorageError::io(path, e).into()),
        }
        input
            .read_exact(&mut frame[1..])
            .map_err(|_| corrupt(format!("truncated frame header after {} records", records.len())))?;
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if len > MAX_RECORD_LEN {
            return Err(corrupt(format!("record length {len} out of range")));
        }
        let mut payload = vec![0u8; len as usize];
        input
            .read_exact(&mut payload)
            .map_err(|_| corrupt(format!("truncated record {}", records.len())))?;
        let actual = crc32fast::hash(&payload);
        if actual != crc {
            return Err(corrupt(format!(
                "checksum mismatch in record {}: expected {crc:08x}, got {actual:08x}",
                records.len()
            )));
        }
        let record = JournalRecord::decode(&payload).map_err(|e| corrupt(e.to_string()))?;
        records.push(record);
    }
    Ok(records)
}

/// Where a transaction's log says it got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogState {
    /// The journal is durable; the outcome is not yet decided.
    Prepared,
    /// The transaction committed; its journal must be replayed.
    Committing,
}

/// Persisted status of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnLog {
    /// Transaction number.
    pub txn: u64,
    /// Host that began the transaction.
    pub host: String,
    /// Recorded state.
    pub state: LogState,
}

impl TxnLog {
    /// Durably replaces the log at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the write fails.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| StorageError::corrupt(path, e.to_string()))?;
        write_replace(path, &json)
    }

    /// Reads the log at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptState`] if the file is not a log and
    /// [`StorageError::Io`] if it cannot be read.
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read(path).map_err(|e| StorageError::io(path, e))?;
        serde_json::from_slice(&text).map_err(|e| StorageError::corrupt(path, e.to_string()).into())
    }
}

/// Removes `path`, treating a missing file as already removed.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e).into()),
    }
}
