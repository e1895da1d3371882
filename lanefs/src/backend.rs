//! The transactional storage backend.
//!
//! [`TransactionalBackend`] ties the storage root together: the location
//! index, the lane containers holding series values and metadata, the blob
//! store, the throttle, and the transaction manager. Every read and write
//! names a transaction. Writes are staged in memory and only reach storage
//! when the transaction commits; reads see committed data overlaid with the
//! reading transaction's own staged changes.
//!
//! # File layout
//!
//! ```text
//! data_dir/
//! ├── lanefs.json            <- optional StoreConfig
//! ├── fsdataroots.json       <- optional placement table
//! ├── index/
//! │   ├── locations.snap     <- id -> lane snapshot
//! │   ├── locations.log      <- changes since the snapshot
//! │   └── lanes.seq          <- lane allocator
//! ├── txn/
//! │   ├── txn.seq            <- transaction numbers
//! │   └── <n>.journal, <n>.log
//! ├── series/                <- directory hash of container files
//! │   └── ~2a/c00000000.data, c00000000.meta
//! ├── blob/<id path>/        <- per-path directory hashes of blobs
//! └── mjd/<id path>/         <- point sets of MJD-keyed series
//! ```
//!
//! Each series owns one lane in a `.data` container, holding its values at
//! `position * width`, and the same lane in the matching `.meta` container,
//! holding its element type and interval sets.
//!
//! # Example
//!
//! ```rust
//! use lanefs::backend::{SeriesRange, TransactionalBackend};
//! use lanefs::id::FsId;
//! use lanefs::series::{DataType, SeriesData, TimeSeries};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let backend = TransactionalBackend::open(dir.path())?;
//!
//! let id = FsId::parse("/pa/flux/42")?;
//! let txn = backend.begin("doc-host")?;
//! let series = TimeSeries::from_gaps(id.clone(), 100, SeriesData::Float(vec![1.0, 2.0]), &[], 7)?;
//! backend.write_time_series(txn, &series, false)?;
//! backend.commit_local(txn)?;
//!
//! let txn = backend.begin("doc-host")?;
//! let read = backend.read_time_series(txn, &[id], SeriesRange::new(100, 101, DataType::Float))?;
//! assert_eq!(read[0].data().as_floats(), Some(&[1.0f32, 2.0][..]));
//! backend.rollback(txn)?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blob::{Blob, BlobStore};
use crate::config::{PlacementConfig, StoreConfig};
use crate::dirhash::{load_or_create, DirectoryHash};
use crate::error::{FsError, Result, StorageError};
use crate::id::FsId;
use crate::index::{EntryState, Location, LocationIndex, LocationResult, OrderedRequest};
use crate::interval::{Interval, IntervalSet, TaggedInterval};
use crate::journal::JournalRecord;
use crate::lane::ContainerFile;
use crate::merge::MergePlan;
use crate::mjd::{self, MjdPoints, MjdTimeSeries};
use crate::series::{DataType, SeriesData, TimeSeries};
use crate::throttle::Throttle;
use crate::txn::{BlobOp, MjdOp, PendingSeries, SeriesOp, TransactionManager, TxnId, TxnState};

const INDEX_DIR: &str = "index";
const TXN_DIR: &str = "txn";
const SERIES_DIR: &str = "series";
const MJD_DIR: &str = "mjd";

const META_VERSION: u8 = 1;
const META_FRAME: usize = 8;
const MAX_META_LEN: u32 = 1 << 30;

/// Which container of a pair a lane lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LaneKind {
    Data,
    Meta,
}

impl LaneKind {
    fn extension(self) -> &'static str {
        match self {
            LaneKind::Data => "data",
            LaneKind::Meta => "meta",
        }
    }
}

/// Open container files, placed by a directory hash.
#[derive(Debug)]
struct ContainerSet {
    hash: DirectoryHash,
    header_size: u64,
    lanes_per_file: u32,
    block_size: u64,
    open: Mutex<HashMap<(u64, LaneKind), Arc<ContainerFile>>>,
}

impl ContainerSet {
    fn name(file: u64, kind: LaneKind) -> String {
        format!("c{file:08x}.{}", kind.extension())
    }

    /// The container, opened once and cached. Without `create`, a missing
    /// file yields `None`.
    fn get(&self, file: u64, kind: LaneKind, create: bool) -> Result<Option<Arc<ContainerFile>>> {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(container) = open.get(&(file, kind)) {
            return Ok(Some(Arc::clone(container)));
        }
        let name = Self::name(file, kind);
        let path = if create {
            self.hash.prepare_file(&name)?
        } else {
            let path = self.hash.id_to_file(&name);
            if !path.is_file() {
                return Ok(None);
            }
            path
        };
        let container = Arc::new(ContainerFile::open(
            &path,
            self.header_size,
            self.lanes_per_file,
            self.block_size,
        )?);
        open.insert((file, kind), Arc::clone(&container));
        Ok(Some(container))
    }

    fn paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .hash
            .find_all_ids()?
            .iter()
            .map(|name| self.hash.id_to_file(name))
            .collect())
    }
}

/// Element type and interval sets of a committed series.
#[derive(Debug, Clone, PartialEq)]
struct StoredMeta {
    data_type: DataType,
    valid: IntervalSet<Interval>,
    originators: IntervalSet<TaggedInterval>,
}

impl StoredMeta {
    /// `[len u32][crc32 u32][version u8][type u8][valid][originators]`
    fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = vec![META_VERSION, self.data_type.code()];
        self.valid.write_to(&mut payload)?;
        self.originators.write_to(&mut payload)?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_META_LEN)
            .ok_or_else(|| StorageError::InvalidSeries {
                id: String::new(),
                reason: format!("metadata of {} bytes is too large", payload.len()),
            })?;
        let mut framed = Vec::with_capacity(META_FRAME + payload.len());
        framed.extend_from_slice(&len.to_le_bytes());
        framed.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        framed.extend_from_slice(&payload);
        Ok(framed)
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let [version, code, rest @ ..] = payload else {
            return Err(crate::error::CodecError::Frame {
                reason: "metadata too short".to_string(),
            }
            .into());
        };
        if *version != META_VERSION {
            return Err(crate::error::CodecError::Frame {
                reason: format!("unsupported metadata version {version}"),
            }
            .into());
        }
        let data_type = DataType::from_code(*code).ok_or_else(|| crate::error::CodecError::Frame {
            reason: format!("unknown data type code {code}"),
        })?;
        let mut input = rest;
        Ok(Self {
            data_type,
            valid: IntervalSet::read_from(&mut input)?,
            originators: IntervalSet::read_from(&mut input)?,
        })
    }
}

/// Parameters of a series read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesRange {
    /// First position returned.
    pub start: i64,
    /// Last position returned.
    pub end: i64,
    /// Element type the caller expects.
    pub data_type: DataType,
    /// Value placed in gap slots.
    pub fill: f64,
    /// Fail with [`StorageError::NotFound`] for ids with no storage instead
    /// of returning a non-existent series.
    pub exists_error: bool,
}

impl SeriesRange {
    /// Reads `[start, end]` as `data_type`, zero-filling gaps and failing on
    /// missing ids.
    pub fn new(start: i64, end: i64, data_type: DataType) -> Self {
        Self {
            start,
            end,
            data_type,
            fill: 0.0,
            exists_error: true,
        }
    }

    /// Uses `fill` for gap slots.
    #[must_use]
    pub fn with_fill(mut self, fill: f64) -> Self {
        self.fill = fill;
        self
    }

    /// Returns non-existent series for ids with no storage.
    #[must_use]
    pub fn allow_missing(mut self) -> Self {
        self.exists_error = false;
        self
    }

    /// Rejects reversed or negative ranges and ranges whose buffer could not
    /// be addressed.
    fn validate(&self) -> Result<()> {
        let addressable = self
            .checked_len()
            .and_then(|len| len.checked_mul(self.data_type.width()))
            .is_some_and(|bytes| isize::try_from(bytes).is_ok());
        if self.start < 0 || self.end < self.start || !addressable {
            return Err(StorageError::InvalidRange {
                start: self.start,
                end: self.end,
            }
            .into());
        }
        Ok(())
    }

    fn checked_len(&self) -> Option<usize> {
        let span = self.end.checked_sub(self.start)?.checked_add(1)?;
        usize::try_from(span).ok()
    }

    fn len(&self) -> usize {
        self.checked_len().unwrap_or(0)
    }
}

/// Valid and originator intervals of one series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesMetadata {
    /// Series id.
    pub id: FsId,
    /// Element type.
    pub data_type: DataType,
    /// Valid positions.
    pub valid: IntervalSet<Interval>,
    /// Originators of the valid positions.
    pub originators: IntervalSet<TaggedInterval>,
}

/// What recovery did when the backend was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Transactions past their commit point whose journals were replayed.
    pub replayed: usize,
    /// Transactions that never reached their commit point.
    pub rolled_back: usize,
    /// Index entries left `New` by unfinished transactions.
    pub removed_new_ids: usize,
}

/// How a transaction sees one series.
#[derive(Debug)]
enum SeriesView {
    Missing,
    Committed(Location, StoredMeta),
    Staged(PendingSeries),
}

/// A transactional series and blob store rooted at one data directory.
#[derive(Debug)]
pub struct TransactionalBackend {
    data_dir: PathBuf,
    config: StoreConfig,
    throttle: Throttle,
    index: LocationIndex,
    txns: TransactionManager,
    blobs: BlobStore,
    mjd: BlobStore,
    containers: ContainerSet,
    /// Readers share it; applying a commit takes it exclusively so no reader
    /// sees half a transaction.
    commit_gate: RwLock<()>,
    recovery: RecoveryReport,
}

impl TransactionalBackend {
    /// Opens the storage root at `data_dir` with the configuration files
    /// found there, recovering any transactions left by a crash.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError`] for bad configuration and
    /// [`StorageError::CorruptState`] if on-disk state is inconsistent.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        crate::dirhash::create_dir_retrying(data_dir)?;
        let config = StoreConfig::load(data_dir)?;
        let placement = PlacementConfig::load(data_dir)?;
        Self::open_with(data_dir, config, placement)
    }

    /// Opens the storage root with explicit configuration.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionalBackend::open`].
    pub fn open_with(data_dir: impl AsRef<Path>, config: StoreConfig, placement: PlacementConfig) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        config.validate()?;
        crate::dirhash::create_dir_retrying(&data_dir)?;

        let series_dir = data_dir.join(SERIES_DIR);
        let hash = load_or_create(&series_dir, config.files_per_store, config.max_files_per_dir, true)?
            .ok_or_else(|| StorageError::corrupt(&series_dir, "container directory hash missing"))?;

        let mut backend = Self {
            throttle: Throttle::new(
                config.throttle_total,
                config.throttle_min_greedy,
                config.throttle_max_greedy,
            )?,
            index: LocationIndex::open(
                &data_dir.join(INDEX_DIR),
                config.lanes_per_file,
                config.sequence_reserve,
            )?,
            txns: TransactionManager::open(&data_dir.join(TXN_DIR), config.sequence_reserve)?,
            blobs: BlobStore::new(placement.clone(), config.files_per_store, config.max_files_per_dir),
            mjd: BlobStore::with_type_dir(MJD_DIR, placement, config.files_per_store, config.max_files_per_dir),
            containers: ContainerSet {
                hash,
                header_size: config.container_header_size,
                lanes_per_file: config.lanes_per_file,
                block_size: config.lane_block_size,
                open: Mutex::new(HashMap::new()),
            },
            commit_gate: RwLock::new(()),
            recovery: RecoveryReport::default(),
            config,
            data_dir,
        };
        backend.recovery = backend.recover()?;
        info!(
            path = %backend.data_dir.display(),
            series = backend.index.len(),
            replayed = backend.recovery.replayed,
            rolled_back = backend.recovery.rolled_back,
            "opened storage root"
        );
        Ok(backend)
    }

    /// Replays transactions that passed their commit point, rolls back the
    /// rest, and drops index entries no committed transaction owns.
    fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let found = self.txns.recover()?;
        for txn in &found {
            match &txn.records {
                Some(records) => {
                    info!(txn = txn.txn, records = records.len(), "replaying committed transaction");
                    self.apply(records)?;
                    report.replayed += 1;
                }
                None => {
                    info!(txn = txn.txn, "rolling back unfinished transaction");
                    report.rolled_back += 1;
                }
            }
        }
        report.removed_new_ids = self.index.remove_every_new_id();
        self.index.commit_pending_modifications()?;
        for txn in &found {
            self.txns.discard_files(txn.txn)?;
        }
        Ok(report)
    }

    /// The data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The configuration in force.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The admission-control throttle.
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// What recovery did when this backend was opened.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_gate(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit_gate.write().unwrap_or_else(|e| e.into_inner())
    }

    // ----- transactions -----

    /// Starts a transaction for `host`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the transaction sequence cannot be
    /// advanced.
    pub fn begin(&self, host: &str) -> Result<TxnId> {
        self.txns.begin(host)
    }

    /// State of `txn`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::TransactionError::UnknownTransaction`] for
    /// ids this backend never issued.
    pub fn transaction_state(&self, txn: TxnId) -> Result<TxnState> {
        self.txns.state(txn)
    }

    /// Makes `txn` durable without deciding its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::TransactionError::InvalidState`] unless `txn`
    /// is active, and I/O errors from the journal or index.
    pub fn prepare_local(&self, txn: TxnId) -> Result<()> {
        let _permit = self.throttle.acquire_read_permit();
        self.txns
            .prepare(txn, || self.index.commit_pending_modifications())
    }

    /// Commits `txn`, preparing it first if it is still active. Once this
    /// returns, the changes survive a crash and are visible to every
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::TransactionError::InvalidState`] for finished
    /// transactions. An error after the commit point leaves `txn` in
    /// [`TxnState::Committing`] with its journal intact: it cannot be rolled
    /// back, and is finished by calling this again or by recovery.
    pub fn commit_local(&self, txn: TxnId) -> Result<()> {
        if self.txns.state(txn)? == TxnState::Active {
            self.prepare_local(txn)?;
        }
        let _permit = self.throttle.acquire_read_permit();
        let records = self.txns.begin_commit(txn)?;
        {
            let _gate = self.write_gate();
            if let Err(e) = self.apply(&records) {
                warn!(txn = %txn, error = %e, "applying commit failed, journal kept for replay");
                return Err(e);
            }
        }
        self.txns.finish_commit(txn)
    }

    /// Discards everything `txn` staged.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::TransactionError::InvalidState`] if `txn` has
    /// finished or passed its commit point.
    pub fn rollback(&self, txn: TxnId) -> Result<()> {
        let _permit = self.throttle.acquire_read_permit();
        let transaction = self.txns.rollback(txn)?;
        let removed = self.index.remove_all_new_ids(transaction.staged_series_ids());
        self.index.commit_pending_modifications()?;
        debug!(txn = %txn, released_lanes = removed, "released uncommitted storage");
        Ok(())
    }

    /// Applies redo records to storage.
    fn apply(&self, records: &[JournalRecord]) -> Result<()> {
        let mut touched: BTreeMap<(u64, bool), Arc<ContainerFile>> = BTreeMap::new();
        for record in records {
            match record {
                JournalRecord::SeriesWrite {
                    assignment,
                    data_type,
                    position,
                    bytes,
                    ..
                } => {
                    let container = self.container(assignment.file, LaneKind::Data)?;
                    let space = container.address_space(assignment.lane)?;
                    container.write_lane(&space, lane_offset(0, *position, *data_type)?, bytes)?;
                    touched.insert((assignment.file, false), container);
                }
                JournalRecord::SeriesMeta {
                    id,
                    assignment,
                    data_type,
                    valid,
                    originators,
                } => {
                    let meta = StoredMeta {
                        data_type: *data_type,
                        valid: valid.clone(),
                        originators: originators.clone(),
                    };
                    let container = self.container(assignment.file, LaneKind::Meta)?;
                    let space = container.address_space(assignment.lane)?;
                    container.write_lane(&space, 0, &meta.encode()?)?;
                    touched.insert((assignment.file, true), container);
                    self.index.insert(
                        id,
                        Location {
                            assignment: *assignment,
                            offset: 0,
                            state: EntryState::Persistent,
                        },
                    );
                }
                JournalRecord::SeriesDelete { id } => {
                    self.index.remove_id(id);
                }
                JournalRecord::BlobPut { id, origin, bytes } => self.blobs.put(id, *origin, bytes)?,
                JournalRecord::BlobDelete { id } => self.blobs.remove(id)?,
                JournalRecord::MjdPut { id, bytes } => self.mjd.put(id, 0, bytes)?,
                JournalRecord::MjdDelete { id } => self.mjd.remove(id)?,
            }
        }
        if self.config.sync_on_commit {
            for container in touched.values() {
                container.sync()?;
            }
        }
        self.index.commit_pending_modifications()
    }

    fn container(&self, file: u64, kind: LaneKind) -> Result<Arc<ContainerFile>> {
        self.containers
            .get(file, kind, true)?
            .ok_or_else(|| StorageError::NotFound {
                id: ContainerSet::name(file, kind),
            }
            .into())
    }

    // ----- series -----

    fn read_meta(&self, id: &FsId, location: &Location) -> Result<StoredMeta> {
        let Some(container) = self.containers.get(location.assignment.file, LaneKind::Meta, false)? else {
            return Err(StorageError::corrupt(
                self.containers.hash.id_to_file(&ContainerSet::name(location.assignment.file, LaneKind::Meta)),
                format!("metadata container missing for '{id}'"),
            )
            .into());
        };
        let space = container.address_space(location.assignment.lane)?;
        let mut frame = [0u8; META_FRAME];
        container.read_lane(&space, 0, &mut frame)?;
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let corrupt = |reason: String| -> FsError {
            StorageError::corrupt(
                container.path(),
                format!("lane {} metadata for '{id}': {reason}", location.assignment.lane),
            )
            .into()
        };
        if len == 0 || len > MAX_META_LEN {
            return Err(corrupt(format!("bad length {len}")));
        }
        let mut payload = vec![0u8; len as usize];
        container.read_lane(&space, META_FRAME as u64, &mut payload)?;
        let actual = crc32fast::hash(&payload);
        if actual != crc {
            return Err(corrupt(format!("checksum mismatch: expected {crc:08x}, got {actual:08x}")));
        }
        StoredMeta::decode(&payload).map_err(|e| corrupt(e.to_string()))
    }

    /// Reads committed values of `location` for `piece` into `data`, which
    /// starts at position `start`.
    fn read_values(
        &self,
        location: &Location,
        data_type: DataType,
        piece: Interval,
        start: i64,
        data: &mut SeriesData,
    ) -> Result<()> {
        let Some(container) = self.containers.get(location.assignment.file, LaneKind::Data, false)? else {
            return Err(StorageError::corrupt(
                self.containers.hash.id_to_file(&ContainerSet::name(location.assignment.file, LaneKind::Data)),
                "data container missing for valid positions",
            )
            .into());
        };
        let space = container.address_space(location.assignment.lane)?;
        let mut bytes = vec![0u8; len_of(piece) * data_type.width()];
        container.read_lane(&space, lane_offset(location.offset, piece.start, data_type)?, &mut bytes)?;
        let values = SeriesData::from_le_bytes(data_type, &bytes)?;
        data.overlay(index_of(piece.start, start), &values);
        Ok(())
    }

    fn series_view(&self, txn: TxnId, id: &FsId, location: Option<Location>) -> Result<SeriesView> {
        let staged = self.txns.with_readable(txn, |t| t.series.get(id).cloned())?;
        match staged {
            Some(SeriesOp::Delete) => Ok(SeriesView::Missing),
            Some(SeriesOp::Write(pending)) => Ok(SeriesView::Staged(pending)),
            None => match location {
                Some(location) if location.state == EntryState::Persistent => {
                    let meta = self.read_meta(id, &location)?;
                    Ok(SeriesView::Committed(location, meta))
                }
                _ => Ok(SeriesView::Missing),
            },
        }
    }

    fn assemble(&self, id: &FsId, range: &SeriesRange, view: SeriesView) -> Result<TimeSeries> {
        let check_type = |stored: DataType| -> Result<()> {
            if stored == range.data_type {
                Ok(())
            } else {
                Err(StorageError::TypeMismatch {
                    id: id.to_string(),
                    stored: stored.name(),
                    requested: range.data_type.name(),
                }
                .into())
            }
        };
        let mut data = SeriesData::filled(range.data_type, range.len(), range.fill);

        let (valid, originators) = match view {
            SeriesView::Missing if range.exists_error => {
                return Err(StorageError::NotFound { id: id.to_string() }.into());
            }
            SeriesView::Missing => return Ok(TimeSeries::non_existent(id.clone(), range.data_type)),
            SeriesView::Committed(location, meta) => {
                check_type(meta.data_type)?;
                for piece in meta.valid.spanned_intervals(range.start, range.end, true) {
                    self.read_values(&location, meta.data_type, piece, range.start, &mut data)?;
                }
                (meta.valid, meta.originators)
            }
            SeriesView::Staged(pending) => {
                check_type(pending.data_type)?;
                if pending.location.state == EntryState::Persistent {
                    let base = self.read_meta(id, &pending.location)?;
                    for piece in base.valid.spanned_intervals(range.start, range.end, true) {
                        self.read_values(&pending.location, base.data_type, piece, range.start, &mut data)?;
                    }
                }
                for (position, values) in &pending.writes {
                    overlay_clipped(&mut data, range, *position, values);
                }
                fill_gaps(&mut data, range, &pending.valid);
                (pending.valid, pending.originators)
            }
        };

        TimeSeries::checked(
            id.clone(),
            range.start,
            range.end,
            data,
            valid.spanned_intervals(range.start, range.end, true),
            originators.spanned_intervals(range.start, range.end, true),
            true,
        )
    }

    /// Reads `ids` over `range` as `txn` sees them, in request order. The
    /// batch fans out over as many threads as the throttle grants.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidRange`] for a bad range,
    /// [`StorageError::NotFound`] for a missing id unless the range allows
    /// it, and [`StorageError::TypeMismatch`] if a series holds another type.
    pub fn read_time_series(&self, txn: TxnId, ids: &[FsId], range: SeriesRange) -> Result<Vec<TimeSeries>> {
        range.validate()?;
        self.txns.with_readable(txn, |_| ())?;
        let _gate = self.read_gate();
        let located = self.locate(ids);
        self.fan_out(&located, |found| {
            let view = self.series_view(txn, &found.id, found.location)?;
            self.assemble(&found.id, &range, view)
        })
    }

    /// Reads `ids` over `range` like
    /// [`TransactionalBackend::read_time_series`], keeping only the positions
    /// `mask` selects. `mask[i]` selects position `range.start + i`; each
    /// result is compacted by [`TimeSeries::select`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidRange`] unless `mask` has one entry per
    /// position of `range` and selects at least one, plus the errors of
    /// [`TransactionalBackend::read_time_series`].
    pub fn read_time_series_selected(
        &self,
        txn: TxnId,
        ids: &[FsId],
        range: SeriesRange,
        mask: &[bool],
    ) -> Result<Vec<TimeSeries>> {
        range.validate()?;
        if mask.len() != range.len() || !mask.contains(&true) {
            return Err(StorageError::InvalidRange {
                start: range.start,
                end: range.end,
            }
            .into());
        }
        self.read_time_series(txn, ids, range)?
            .iter()
            .map(|series| series.select(mask))
            .collect()
    }

    fn locate(&self, ids: &[FsId]) -> Vec<LocationResult> {
        let requests = ids
            .iter()
            .enumerate()
            .map(|(original_order, id)| OrderedRequest {
                id: id.clone(),
                original_order,
            })
            .collect();
        self.index.location_for(requests)
    }

    /// Runs `work` over `items` on up to as many threads as the throttle
    /// grants, keeping results in item order.
    fn fan_out<I, T, F>(&self, items: &[I], work: F) -> Result<Vec<T>>
    where
        I: Sync,
        T: Send,
        F: Fn(&I) -> Result<T> + Sync,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let permits = self.throttle.greedy_acquire_permits();
        let workers = permits.count().clamp(1, items.len());
        if workers == 1 {
            return items.iter().map(&work).collect();
        }
        let per_worker = items.len().div_ceil(workers);
        debug!(items = items.len(), workers, "fanning out batch");
        let work = &work;
        let batches: Vec<Result<Vec<T>>> = thread::scope(|scope| {
            let handles: Vec<_> = items
                .chunks(per_worker)
                .map(|chunk| scope.spawn(move || chunk.iter().map(work).collect::<Result<Vec<T>>>()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });
        drop(permits);

        let mut out = Vec::with_capacity(items.len());
        for batch in batches {
            out.extend(batch?);
        }
        Ok(out)
    }

    fn staged_or_committed(&self, txn: TxnId, id: &FsId, data_type: DataType) -> Result<PendingSeries> {
        let staged = self.txns.with_active(txn, "write", |t| Ok(t.series.get(id).cloned()))?;
        match staged {
            Some(SeriesOp::Write(pending)) => Ok(pending),
            // Writing after a staged delete starts over in a fresh lane; the
            // committed entry keeps serving other readers until commit and the
            // old bytes are orphaned after it.
            Some(SeriesOp::Delete) => Ok(Self::empty_pending(self.index.allocate_detached()?, data_type)),
            None => {
                let location = self
                    .index
                    .storage_for(id, true)?
                    .ok_or_else(|| StorageError::NotFound { id: id.to_string() })?;
                if location.state != EntryState::Persistent {
                    return Ok(Self::empty_pending(location, data_type));
                }
                let meta = self.read_meta(id, &location)?;
                Ok(PendingSeries {
                    data_type: meta.data_type,
                    location,
                    writes: Vec::new(),
                    valid: meta.valid,
                    originators: meta.originators,
                })
            }
        }
    }

    fn empty_pending(location: Location, data_type: DataType) -> PendingSeries {
        PendingSeries {
            data_type,
            location,
            writes: Vec::new(),
            valid: IntervalSet::new(),
            originators: IntervalSet::new(),
        }
    }

    fn stage_series(&self, txn: TxnId, id: &FsId, op: SeriesOp) -> Result<()> {
        self.txns.with_active(txn, "write", |t| {
            t.series.insert(id.clone(), op);
            Ok(())
        })
    }

    /// Stages a write of `series` in `txn`.
    ///
    /// Without `overwrite`, the new valid positions are merged over the
    /// existing ones and existing data under the new series' gaps is kept.
    /// With `overwrite`, everything in `[series.start, series.end]` is
    /// replaced, gaps included.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidSeries`] for a non-existent series or
    /// negative positions, [`StorageError::TypeMismatch`] if the stored
    /// series has another type, and
    /// [`crate::error::TransactionError::WriteConflict`] if another
    /// transaction is writing the id.
    pub fn write_time_series(&self, txn: TxnId, series: &TimeSeries, overwrite: bool) -> Result<()> {
        let id = series.id();
        if !series.exists() {
            return Err(StorageError::InvalidSeries {
                id: id.to_string(),
                reason: "cannot write a non-existent series".to_string(),
            }
            .into());
        }
        if series.start() < 0 {
            return Err(StorageError::InvalidSeries {
                id: id.to_string(),
                reason: format!("negative start position {}", series.start()),
            }
            .into());
        }
        let _permit = self.throttle.acquire_read_permit();
        self.txns.claim_series(txn, id, "write")?;

        let mut pending = self.staged_or_committed(txn, id, series.data_type())?;
        if pending.data_type != series.data_type() {
            return Err(StorageError::TypeMismatch {
                id: id.to_string(),
                stored: pending.data_type.name(),
                requested: series.data_type().name(),
            }
            .into());
        }

        let new_valid = series.valid().as_slice().to_vec();
        let new_originators = series.originators().as_slice().to_vec();
        let plan = if overwrite {
            pending.valid.delete_interval(series.start(), series.end());
            pending.originators.delete_interval(series.start(), series.end());
            MergePlan::overwrite(new_valid, new_originators)
        } else {
            MergePlan::new(new_valid, new_originators, pending.valid.clone())
        };

        let mut chunks = 0;
        for chunk in plan.chunks() {
            let from = index_of(chunk.start(), series.start());
            let to = index_of(chunk.end(), series.start()) + 1;
            pending.writes.push((chunk.start(), series.data().slice(from, to)));
            for valid in &chunk.valid {
                pending.valid.merge_interval(*valid);
            }
            for originator in &chunk.originators {
                pending.originators.merge_interval(*originator);
            }
            chunks += 1;
        }
        debug!(txn = %txn, %id, chunks, overwrite, "staged series write");
        self.stage_series(txn, id, SeriesOp::Write(pending))
    }

    /// Stages removal of a whole series.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if `txn` cannot see the series.
    pub fn delete_time_series(&self, txn: TxnId, id: &FsId) -> Result<()> {
        self.txns.claim_series(txn, id, "delete")?;
        if !self.series_exists(txn, id)? {
            return Err(StorageError::NotFound { id: id.to_string() }.into());
        }
        self.stage_series(txn, id, SeriesOp::Delete)
    }

    /// Stages removal of the positions `[start, end]` from a series. The
    /// values stay on disk but are no longer valid.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if `txn` cannot see the series and
    /// [`StorageError::InvalidRange`] for a reversed range.
    pub fn delete_interval(&self, txn: TxnId, id: &FsId, start: i64, end: i64) -> Result<()> {
        if end < start {
            return Err(StorageError::InvalidRange { start, end }.into());
        }
        self.txns.claim_series(txn, id, "delete")?;
        if !self.series_exists(txn, id)? {
            return Err(StorageError::NotFound { id: id.to_string() }.into());
        }
        let mut pending = self.staged_or_committed(txn, id, DataType::Float)?;
        pending.valid.delete_interval(start, end);
        pending.originators.delete_interval(start, end);
        self.stage_series(txn, id, SeriesOp::Write(pending))
    }

    /// Valid and originator intervals of each id as `txn` sees them; `None`
    /// for ids with no series.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptState`] if stored metadata is damaged.
    pub fn series_metadata(&self, txn: TxnId, ids: &[FsId]) -> Result<Vec<Option<SeriesMetadata>>> {
        let _gate = self.read_gate();
        let located = self.locate(ids);
        self.fan_out(&located, |found| {
            Ok(match self.series_view(txn, &found.id, found.location)? {
                SeriesView::Missing => None,
                SeriesView::Committed(_, meta) => Some(SeriesMetadata {
                    id: found.id.clone(),
                    data_type: meta.data_type,
                    valid: meta.valid,
                    originators: meta.originators,
                }),
                SeriesView::Staged(pending) => Some(SeriesMetadata {
                    id: found.id.clone(),
                    data_type: pending.data_type,
                    valid: pending.valid,
                    originators: pending.originators,
                }),
            })
        })
    }

    /// `true` if `txn` can see a series called `id`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::TransactionError`] if `txn` is finished.
    pub fn series_exists(&self, txn: TxnId, id: &FsId) -> Result<bool> {
        let staged = self.txns.with_readable(txn, |t| match t.series.get(id) {
            Some(SeriesOp::Write(_)) => Some(true),
            Some(SeriesOp::Delete) => Some(false),
            None => None,
        })?;
        Ok(match staged {
            Some(exists) => exists,
            None => self
                .index
                .storage_for(id, false)?
                .is_some_and(|l| l.state == EntryState::Persistent),
        })
    }

    // ----- blobs -----

    /// Stages `bytes` as the new contents of blob `id`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::TransactionError::WriteConflict`] if another
    /// transaction is writing the blob.
    pub fn write_blob(&self, txn: TxnId, id: &FsId, origin: u64, bytes: &[u8]) -> Result<()> {
        self.txns.claim_blob(txn, id, "write")?;
        self.txns.with_active(txn, "write", |t| {
            t.blobs.insert(
                id.clone(),
                BlobOp::Put {
                    origin,
                    bytes: bytes.to_vec(),
                },
            );
            Ok(())
        })?;
        debug!(txn = %txn, %id, len = bytes.len(), "staged blob write");
        Ok(())
    }

    fn blob_view(&self, txn: TxnId, id: &FsId) -> Result<Option<Blob>> {
        let staged = self.txns.with_readable(txn, |t| t.blobs.get(id).cloned())?;
        match staged {
            Some(BlobOp::Put { origin, bytes }) => Ok(Some(Blob { origin, bytes })),
            Some(BlobOp::Delete) => Ok(None),
            None => {
                let _gate = self.read_gate();
                self.blobs.get(id)
            }
        }
    }

    /// Contents of blob `id` as `txn` sees them.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if there is no such blob and
    /// [`StorageError::CorruptState`] if its file is damaged.
    pub fn read_blob(&self, txn: TxnId, id: &FsId) -> Result<Blob> {
        let _permit = self.throttle.acquire_read_permit();
        self.blob_view(txn, id)?
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() }.into())
    }

    /// Reads several blobs, in request order, fanning out like
    /// [`TransactionalBackend::read_time_series`].
    ///
    /// # Errors
    ///
    /// Same as [`TransactionalBackend::read_blob`].
    pub fn read_blobs(&self, txn: TxnId, ids: &[FsId]) -> Result<Vec<Blob>> {
        self.fan_out(ids, |id| {
            self.blob_view(txn, id)?
                .ok_or_else(|| StorageError::NotFound { id: id.to_string() }.into())
        })
    }

    /// Stages removal of blob `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if `txn` cannot see the blob.
    pub fn delete_blob(&self, txn: TxnId, id: &FsId) -> Result<()> {
        self.txns.claim_blob(txn, id, "delete")?;
        if !self.blob_exists(txn, id)? {
            return Err(StorageError::NotFound { id: id.to_string() }.into());
        }
        self.txns.with_active(txn, "delete", |t| {
            t.blobs.insert(id.clone(), BlobOp::Delete);
            Ok(())
        })
    }

    /// `true` if `txn` can see blob `id`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::TransactionError`] if `txn` is finished.
    pub fn blob_exists(&self, txn: TxnId, id: &FsId) -> Result<bool> {
        let staged = self.txns.with_readable(txn, |t| match t.blobs.get(id) {
            Some(BlobOp::Put { .. }) => Some(true),
            Some(BlobOp::Delete) => Some(false),
            None => None,
        })?;
        match staged {
            Some(exists) => Ok(exists),
            None => self.blobs.exists(id),
        }
    }

    // ----- MJD series -----

    /// Stages `series` into the point set of its id. Points replace stored
    /// points at the same times; with `overwrite`, every stored point inside
    /// the series' range is dropped first, so an empty overwrite truncates.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidSeries`] for a non-existent series and
    /// [`crate::error::TransactionError::WriteConflict`] if another
    /// transaction is writing the id.
    pub fn write_mjd_time_series(&self, txn: TxnId, series: &MjdTimeSeries, overwrite: bool) -> Result<()> {
        if !series.exists() {
            return Err(StorageError::InvalidSeries {
                id: series.id().to_string(),
                reason: "cannot write a non-existent series".to_string(),
            }
            .into());
        }
        let id = series.id();
        self.txns.claim_mjd(txn, id, "write")?;
        let _permit = self.throttle.acquire_read_permit();
        let mut points = self.mjd_view(txn, id)?.unwrap_or_default();
        points.write(series, overwrite);
        self.txns.with_active(txn, "write", |t| {
            t.mjd.insert(id.clone(), MjdOp::Put(points));
            Ok(())
        })?;
        debug!(txn = %txn, %id, points = series.len(), overwrite, "staged mjd write");
        Ok(())
    }

    fn mjd_view(&self, txn: TxnId, id: &FsId) -> Result<Option<MjdPoints>> {
        let staged = self.txns.with_readable(txn, |t| t.mjd.get(id).cloned())?;
        match staged {
            Some(MjdOp::Put(points)) => Ok(Some(points)),
            Some(MjdOp::Delete) => Ok(None),
            None => {
                let stored = {
                    let _gate = self.read_gate();
                    self.mjd.get(id)?
                };
                stored
                    .map(|blob| {
                        MjdPoints::decode(&blob.bytes).map_err(|e| {
                            FsError::from(StorageError::corrupt(self.data_dir.join(MJD_DIR), format!("{id}: {e}")))
                        })
                    })
                    .transpose()
            }
        }
    }

    /// Points of each id inside `[start, end]`, in request order. Ids `txn`
    /// cannot see come back non-existent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidMjdRange`] for a reversed or NaN range
    /// and [`StorageError::CorruptState`] if a stored point set is damaged.
    pub fn read_mjd_time_series(
        &self,
        txn: TxnId,
        ids: &[FsId],
        start: f64,
        end: f64,
    ) -> Result<Vec<MjdTimeSeries>> {
        mjd::validate_range(start, end)?;
        self.fan_out(ids, |id| {
            Ok(match self.mjd_view(txn, id)? {
                Some(points) => points.read(id, start, end),
                None => MjdTimeSeries::non_existent(id.clone(), start, end),
            })
        })
    }

    /// Stages removal of every point of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if `txn` cannot see the id.
    pub fn delete_mjd_time_series(&self, txn: TxnId, id: &FsId) -> Result<()> {
        self.txns.claim_mjd(txn, id, "delete")?;
        if self.mjd_view(txn, id)?.is_none() {
            return Err(StorageError::NotFound { id: id.to_string() }.into());
        }
        self.txns.with_active(txn, "delete", |t| {
            t.mjd.insert(id.clone(), MjdOp::Delete);
            Ok(())
        })
    }

    /// Committed MJD series ids starting with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the point set directories cannot be listed.
    pub fn find_mjd_ids(&self, prefix: &str) -> Result<Vec<FsId>> {
        self.mjd.find_ids(prefix)
    }

    // ----- enumeration and diagnostics -----

    /// Committed series ids starting with `prefix`, sorted.
    pub fn find_series_ids(&self, prefix: &str) -> Vec<FsId> {
        self.index.find_ids_with_prefix(prefix)
    }

    /// Committed blob ids starting with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the blob directories cannot be listed.
    pub fn find_blob_ids(&self, prefix: &str) -> Result<Vec<FsId>> {
        self.blobs.find_ids(prefix)
    }

    /// Every committed id of any kind starting with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionalBackend::find_blob_ids`].
    pub fn find_ids(&self, prefix: &str) -> Result<Vec<FsId>> {
        let mut ids = self.find_series_ids(prefix);
        ids.extend(self.find_blob_ids(prefix)?);
        ids.extend(self.find_mjd_ids(prefix)?);
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Paths of every container file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the series directories cannot be
    /// listed.
    pub fn container_files(&self) -> Result<Vec<PathBuf>> {
        self.containers.paths()
    }

    /// Leaf occupancy histogram of the container directory hash.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionalBackend::container_files`].
    pub fn container_histogram(&self) -> Result<BTreeMap<usize, usize>> {
        self.containers.hash.files_per_directory()
    }

    /// Leaf occupancy histograms of every blob directory hash under
    /// `prefix`, keyed by hash root.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the blob directories cannot be listed.
    pub fn blob_histograms(&self, prefix: &str) -> Result<BTreeMap<PathBuf, BTreeMap<usize, usize>>> {
        let mut histograms = BTreeMap::new();
        for hash in self.blobs.hashes().hashes_under(prefix)? {
            histograms.insert(hash.root().to_path_buf(), hash.files_per_directory()?);
        }
        Ok(histograms)
    }
}

/// Byte offset of `position` in a lane whose series starts at `base`.
fn lane_offset(base: u64, position: i64, data_type: DataType) -> Result<u64> {
    u64::try_from(position)
        .ok()
        .and_then(|p| p.checked_mul(data_type.width() as u64))
        .and_then(|o| o.checked_add(base))
        .ok_or_else(|| StorageError::InvalidRange {
            start: position,
            end: position,
        }
        .into())
}

/// Slot of `position` in a buffer starting at `start`.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)] // callers pass position >= start
fn index_of(position: i64, start: i64) -> usize {
    (position - start) as usize
}

fn len_of(interval: Interval) -> usize {
    index_of(interval.end, interval.start) + 1
}

/// Copies the part of `values` (starting at `position`) that falls inside
/// `range` into `data`.
fn overlay_clipped(data: &mut SeriesData, range: &SeriesRange, position: i64, values: &SeriesData) {
    let last = position + values.len() as i64 - 1;
    let lo = position.max(range.start);
    let hi = last.min(range.end);
    if lo > hi {
        return;
    }
    let piece = values.slice(index_of(lo, position), index_of(hi, position) + 1);
    data.overlay(index_of(lo, range.start), &piece);
}

/// Resets every slot of `data` outside `valid` to the range's fill value.
fn fill_gaps(data: &mut SeriesData, range: &SeriesRange, valid: &IntervalSet<Interval>) {
    // None once a valid piece reaches the last representable position.
    let mut cursor = Some(range.start);
    let mut gaps = Vec::new();
    for piece in valid.spanned_intervals(range.start, range.end, true) {
        if let Some(from) = cursor.filter(|from| piece.start > *from) {
            gaps.push(Interval::new(from, piece.start - 1));
        }
        cursor = piece.end.checked_add(1);
    }
    if let Some(from) = cursor.filter(|from| *from <= range.end) {
        gaps.push(Interval::new(from, range.end));
    }
    for gap in gaps {
        let filler = SeriesData::filled(data.data_type(), len_of(gap), range.fill);
        data.overlay(index_of(gap.start, range.start), &filler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransactionError;
    use tempfile::tempdir;

    fn id(s: &str) -> FsId {
        FsId::parse(s).unwrap()
    }

    fn small_config() -> StoreConfig {
        StoreConfig {
            lanes_per_file: 4,
            lane_block_size: 64,
            container_header_size: 32,
            max_files_per_dir: 4,
            files_per_store: 64,
            sequence_reserve: 8,
            throttle_total: 4,
            ..StoreConfig::default()
        }
    }

    fn open(dir: &Path) -> TransactionalBackend {
        TransactionalBackend::open_with(dir, small_config(), PlacementConfig::single_root(dir)).unwrap()
    }

    fn ints(id: &FsId, start: i64, values: Vec<i32>, gaps: &[bool], origin: u64) -> TimeSeries {
        TimeSeries::from_gaps(id.clone(), start, SeriesData::Int(values), gaps, origin).unwrap()
    }

    #[test]
    fn test_write_commit_read() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let target = id("/pa/flux/1");

        let txn = backend.begin("test").unwrap();
        backend
            .write_time_series(txn, &ints(&target, 10, vec![1, 2, 3, 4], &[], 5), false)
            .unwrap();
        backend.commit_local(txn).unwrap();

        let txn = backend.begin("test").unwrap();
        let read = backend
            .read_time_series(txn, &[target.clone()], SeriesRange::new(8, 15, DataType::Int).with_fill(-1.0))
            .unwrap();
        assert_eq!(read[0].data().as_ints().unwrap(), &[-1, -1, 1, 2, 3, 4, -1, -1]);
        assert_eq!(read[0].valid().as_slice(), &[Interval::new(10, 13)]);
        assert_eq!(read[0].originator_at(12), Some(5));
        backend.rollback(txn).unwrap();
    }

    #[test]
    fn test_staged_writes_are_private() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let target = id("/pa/flux/2");

        let writer = backend.begin("w").unwrap();
        let reader = backend.begin("r").unwrap();
        backend
            .write_time_series(writer, &ints(&target, 0, vec![9, 9], &[], 1), false)
            .unwrap();

        assert!(backend.series_exists(writer, &target).unwrap());
        assert!(!backend.series_exists(reader, &target).unwrap());
        let range = SeriesRange::new(0, 1, DataType::Int);
        assert_eq!(backend.read_time_series(writer, &[target.clone()], range).unwrap()[0].data().as_ints().unwrap(), &[9, 9]);
        let err = backend.read_time_series(reader, &[target.clone()], range).unwrap_err();
        assert!(err.is_not_found());
        let missing = backend
            .read_time_series(reader, &[target.clone()], range.allow_missing())
            .unwrap();
        assert!(!missing[0].exists());

        let err = backend
            .write_time_series(reader, &ints(&target, 0, vec![1], &[], 2), false)
            .unwrap_err();
        assert!(matches!(err, FsError::Transaction(TransactionError::WriteConflict { .. })));

        backend.rollback(writer).unwrap();
        assert!(backend.find_series_ids("/").is_empty());
        backend
            .write_time_series(reader, &ints(&target, 0, vec![1], &[], 2), false)
            .unwrap();
        backend.commit_local(reader).unwrap();
        assert_eq!(backend.find_series_ids("/pa/"), vec![target]);
    }

    #[test]
    fn test_merge_keeps_existing_under_gaps() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let target = id("/pa/flux/3");

        let txn = backend.begin("t").unwrap();
        backend
            .write_time_series(txn, &ints(&target, 0, (0..11).collect(), &[], 1), false)
            .unwrap();
        backend.commit_local(txn).unwrap();

        // New values at 4, 6 and 8 only; 5 and 7 are gaps in the new buffer.
        let txn = backend.begin("t").unwrap();
        let update = ints(&target, 4, vec![40, -5, 60, -7, 80], &[false, true, false, true, false], 2);
        backend.write_time_series(txn, &update, false).unwrap();
        let expected = [0, 1, 2, 3, 40, 5, 60, 7, 80, 9, 10];
        let range = SeriesRange::new(0, 10, DataType::Int);
        assert_eq!(backend.read_time_series(txn, &[target.clone()], range).unwrap()[0].data().as_ints().unwrap(), &expected);
        backend.commit_local(txn).unwrap();

        let txn = backend.begin("t").unwrap();
        let read = backend.read_time_series(txn, &[target.clone()], range).unwrap();
        assert_eq!(read[0].data().as_ints().unwrap(), &expected);
        assert_eq!(read[0].valid().as_slice(), &[Interval::new(0, 10)]);
        assert_eq!(read[0].originator_at(6), Some(2));
        assert_eq!(read[0].originator_at(5), Some(1));
        backend.rollback(txn).unwrap();
    }

    #[test]
    fn test_overwrite_clears_range() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let target = id("/pa/flux/4");
        let txn = backend.begin("t").unwrap();
        backend
            .write_time_series(txn, &ints(&target, 0, vec![1; 6], &[], 1), false)
            .unwrap();
        backend
            .write_time_series(txn, &ints(&target, 1, vec![7, 0, 7], &[false, true, false], 2), true)
            .unwrap();
        let read = backend
            .read_time_series(txn, &[target.clone()], SeriesRange::new(0, 5, DataType::Int))
            .unwrap();
        assert_eq!(read[0].data().as_ints().unwrap(), &[1, 7, 0, 7, 1, 1]);
        assert_eq!(
            read[0].valid().as_slice(),
            &[Interval::new(0, 1), Interval::new(3, 5)]
        );
        backend.rollback(txn).unwrap();
    }

    #[test]
    fn test_type_mismatch_and_bad_input() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let target = id("/pa/flux/5");
        let txn = backend.begin("t").unwrap();
        backend
            .write_time_series(txn, &ints(&target, 0, vec![1], &[], 1), false)
            .unwrap();
        let doubles = TimeSeries::from_gaps(target.clone(), 0, SeriesData::Double(vec![1.0]), &[], 1).unwrap();
        let err = backend.write_time_series(txn, &doubles, false).unwrap_err();
        assert!(matches!(err, FsError::Storage(StorageError::TypeMismatch { .. })));

        let err = backend
            .read_time_series(txn, &[target.clone()], SeriesRange::new(0, 0, DataType::Float))
            .unwrap_err();
        assert!(matches!(err, FsError::Storage(StorageError::TypeMismatch { .. })));
        let err = backend
            .read_time_series(txn, &[target.clone()], SeriesRange::new(5, 4, DataType::Int))
            .unwrap_err();
        assert!(matches!(err, FsError::Storage(StorageError::InvalidRange { .. })));

        let negative = ints(&id("/pa/flux/6"), -3, vec![1], &[], 1);
        assert!(backend.write_time_series(txn, &negative, false).is_err());
        let nothing = TimeSeries::non_existent(id("/pa/flux/7"), DataType::Int);
        assert!(backend.write_time_series(txn, &nothing, false).is_err());
        backend.rollback(txn).unwrap();
    }

    #[test]
    fn test_delete_series_and_interval() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let a = id("/pa/flux/a");
        let b = id("/pa/flux/b");
        let txn = backend.begin("t").unwrap();
        backend.write_time_series(txn, &ints(&a, 0, vec![1; 10], &[], 1), false).unwrap();
        backend.write_time_series(txn, &ints(&b, 0, vec![2; 10], &[], 1), false).unwrap();
        backend.commit_local(txn).unwrap();

        let txn = backend.begin("t").unwrap();
        backend.delete_time_series(txn, &a).unwrap();
        backend.delete_interval(txn, &b, 3, 5).unwrap();
        assert!(!backend.series_exists(txn, &a).unwrap());
        backend.commit_local(txn).unwrap();

        let txn = backend.begin("t").unwrap();
        let meta = backend.series_metadata(txn, &[a.clone(), b.clone()]).unwrap();
        assert!(meta[0].is_none());
        let b_meta = meta[1].as_ref().unwrap();
        assert_eq!(b_meta.valid.as_slice(), &[Interval::new(0, 2), Interval::new(6, 9)]);
        assert_eq!(b_meta.data_type, DataType::Int);
        assert!(backend.delete_time_series(txn, &a).unwrap_err().is_not_found());
        assert_eq!(backend.find_series_ids("/pa/"), vec![b]);
        backend.rollback(txn).unwrap();
    }

    #[test]
    fn test_blobs_stage_and_commit() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let blob = id("/cal/blob/x");

        let txn = backend.begin("t").unwrap();
        backend.write_blob(txn, &blob, 3, b"first").unwrap();
        assert_eq!(backend.read_blob(txn, &blob).unwrap().bytes, b"first");
        let other = backend.begin("o").unwrap();
        assert!(!backend.blob_exists(other, &blob).unwrap());
        backend.rollback(other).unwrap();
        backend.commit_local(txn).unwrap();

        let txn = backend.begin("t").unwrap();
        assert_eq!(
            backend.read_blobs(txn, &[blob.clone()]).unwrap(),
            vec![Blob {
                origin: 3,
                bytes: b"first".to_vec()
            }]
        );
        backend.delete_blob(txn, &blob).unwrap();
        assert!(backend.read_blob(txn, &blob).unwrap_err().is_not_found());
        backend.commit_local(txn).unwrap();
        assert!(backend.find_blob_ids("/cal/").unwrap().is_empty());
    }

    #[test]
    fn test_finished_transactions_reject_work() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let txn = backend.begin("t").unwrap();
        backend.prepare_local(txn).unwrap();
        assert_eq!(backend.transaction_state(txn).unwrap(), TxnState::Prepared);
        assert!(backend.write_blob(txn, &id("/a/b"), 0, b"x").is_err());
        backend.commit_local(txn).unwrap();
        assert!(backend.commit_local(txn).is_err());
        assert!(backend.rollback(txn).is_err());
    }

    #[test]
    fn test_batch_read_keeps_request_order() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let ids: Vec<FsId> = (0..9).map(|i| id(&format!("/pa/many/{i}"))).collect();
        let txn = backend.begin("t").unwrap();
        for (i, target) in ids.iter().enumerate() {
            backend
                .write_time_series(txn, &ints(target, 0, vec![i32::try_from(i).unwrap(); 3], &[], 1), false)
                .unwrap();
        }
        backend.commit_local(txn).unwrap();

        let mut shuffled = ids.clone();
        shuffled.reverse();
        let txn = backend.begin("t").unwrap();
        let read = backend
            .read_time_series(txn, &shuffled, SeriesRange::new(0, 2, DataType::Int))
            .unwrap();
        for (series, expected) in read.iter().zip(shuffled.iter()) {
            assert_eq!(series.id(), expected);
        }
        assert_eq!(read[0].data().as_ints().unwrap(), &[8, 8, 8]);
        assert_eq!(backend.throttle().current_state(), backend.throttle().total());
        backend.rollback(txn).unwrap();
    }

    #[test]
    fn test_failed_apply_stays_committing_until_replayed() {
        let dir = tempdir().unwrap();
        let target = id("/pa/flux/stuck");
        let data_path = {
            let backend = open(dir.path());
            let txn = backend.begin("t").unwrap();
            backend
                .write_time_series(txn, &ints(&target, 0, vec![5, 6, 7], &[], 1), false)
                .unwrap();
            let location = backend.index.storage_for(&target, false).unwrap().unwrap();
            let name = ContainerSet::name(location.assignment.file, LaneKind::Data);
            let data_path = backend.containers.hash.id_to_file(&name);
            // A directory where the data container belongs makes the apply fail.
            std::fs::create_dir_all(&data_path).unwrap();

            assert!(backend.commit_local(txn).is_err());
            assert_eq!(backend.transaction_state(txn).unwrap(), TxnState::Committing);
            let err = backend.rollback(txn).unwrap_err();
            assert!(matches!(err, FsError::Transaction(TransactionError::InvalidState { .. })));

            let other = backend.begin("o").unwrap();
            let err = backend
                .write_time_series(other, &ints(&target, 0, vec![1], &[], 2), false)
                .unwrap_err();
            assert!(matches!(err, FsError::Transaction(TransactionError::WriteConflict { .. })));
            backend.rollback(other).unwrap();
            data_path
        };

        std::fs::remove_dir(&data_path).unwrap();
        let backend = open(dir.path());
        assert_eq!(backend.recovery_report().replayed, 1);
        let txn = backend.begin("t").unwrap();
        let read = backend
            .read_time_series(txn, &[target.clone()], SeriesRange::new(0, 2, DataType::Int))
            .unwrap();
        assert_eq!(read[0].data().as_ints().unwrap(), &[5, 6, 7]);
        backend.rollback(txn).unwrap();
    }

    #[test]
    fn test_failed_apply_can_be_retried() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let target = id("/pa/flux/retry");
        let txn = backend.begin("t").unwrap();
        backend
            .write_time_series(txn, &ints(&target, 0, vec![3, 4], &[], 1), false)
            .unwrap();
        let location = backend.index.storage_for(&target, false).unwrap().unwrap();
        let data_path = backend
            .containers
            .hash
            .id_to_file(&ContainerSet::name(location.assignment.file, LaneKind::Data));
        std::fs::create_dir_all(&data_path).unwrap();
        assert!(backend.commit_local(txn).is_err());

        std::fs::remove_dir(&data_path).unwrap();
        backend.commit_local(txn).unwrap();
        assert_eq!(backend.transaction_state(txn).unwrap(), TxnState::Committed);
        let reader = backend.begin("r").unwrap();
        let read = backend
            .read_time_series(reader, &[target.clone()], SeriesRange::new(0, 1, DataType::Int))
            .unwrap();
        assert_eq!(read[0].data().as_ints().unwrap(), &[3, 4]);
        backend.rollback(reader).unwrap();
    }

    #[test]
    fn test_write_after_delete_starts_a_fresh_lane() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let target = id("/pa/flux/reborn");
        let txn = backend.begin("t").unwrap();
        backend
            .write_time_series(txn, &ints(&target, 0, vec![1, 2, 3, 4, 5, 6], &[], 1), false)
            .unwrap();
        backend.commit_local(txn).unwrap();
        let old = backend.index.storage_for(&target, false).unwrap().unwrap();

        let txn = backend.begin("t").unwrap();
        backend.delete_time_series(txn, &target).unwrap();
        backend
            .write_time_series(txn, &ints(&target, 2, vec![9, 9], &[], 2), false)
            .unwrap();

        // Other transactions keep reading the committed series until commit.
        let reader = backend.begin("r").unwrap();
        let range = SeriesRange::new(0, 5, DataType::Int).with_fill(-1.0);
        let before = backend.read_time_series(reader, &[target.clone()], range).unwrap();
        assert_eq!(before[0].data().as_ints().unwrap(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(backend.index.storage_for(&target, false).unwrap(), Some(old));
        backend.rollback(reader).unwrap();

        let staged = backend.read_time_series(txn, &[target.clone()], range).unwrap();
        assert_eq!(staged[0].data().as_ints().unwrap(), &[-1, -1, 9, 9, -1, -1]);
        backend.commit_local(txn).unwrap();

        let new = backend.index.storage_for(&target, false).unwrap().unwrap();
        assert_ne!(new.assignment, old.assignment);
        assert_eq!(new.state, EntryState::Persistent);
        let txn = backend.begin("t").unwrap();
        let read = backend.read_time_series(txn, &[target.clone()], range).unwrap();
        assert_eq!(read[0].data().as_ints().unwrap(), &[-1, -1, 9, 9, -1, -1]);
        assert_eq!(read[0].valid().as_slice(), &[Interval::new(2, 3)]);
        assert_eq!(read[0].originator_at(0), None);
        backend.rollback(txn).unwrap();
    }

    #[test]
    fn test_ranges_at_the_end_of_the_position_space() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let target = id("/pa/flux/far");
        let txn = backend.begin("t").unwrap();
        backend
            .write_time_series(txn, &ints(&target, 0, vec![1, 2], &[], 1), false)
            .unwrap();
        backend.commit_local(txn).unwrap();

        let txn = backend.begin("t").unwrap();
        for range in [
            SeriesRange::new(0, i64::MAX, DataType::Int),
            SeriesRange::new(1, i64::MAX, DataType::Double),
        ] {
            let err = backend.read_time_series(txn, &[target.clone()], range).unwrap_err();
            assert!(matches!(err, FsError::Storage(StorageError::InvalidRange { .. })));
        }
        let tail = SeriesRange::new(i64::MAX - 1, i64::MAX, DataType::Int).with_fill(-1.0);
        let read = backend.read_time_series(txn, &[target.clone()], tail).unwrap();
        assert_eq!(read[0].data().as_ints().unwrap(), &[-1, -1]);
        assert!(read[0].valid().is_empty());
        backend.rollback(txn).unwrap();
    }

    #[test]
    fn test_selected_read_compacts_requested_positions() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let target = id("/pa/flux/cadences");
        let missing = id("/pa/flux/absent");
        let gaps = [false, false, false, true];
        let txn = backend.begin("t").unwrap();
        backend
            .write_time_series(txn, &ints(&target, 0, (0..10).map(|v| v * 10).collect(), &gaps, 4), false)
            .unwrap();
        backend.commit_local(txn).unwrap();

        let txn = backend.begin("t").unwrap();
        let range = SeriesRange::new(0, 9, DataType::Int).with_fill(-1.0).allow_missing();
        let mask = [true, false, true, true, true, false, false, false, true, false];
        let read = backend
            .read_time_series_selected(txn, &[target.clone(), missing], range, &mask)
            .unwrap();
        assert_eq!(read[0].data().as_ints().unwrap(), &[0, 20, -1, 40, 80]);
        assert_eq!(read[0].valid().as_slice(), &[Interval::new(0, 1), Interval::new(3, 4)]);
        assert_eq!(read[0].originator_at(4), Some(4));
        assert!(!read[1].exists());

        for bad in [&mask[..9], &[false; 10][..]] {
            let err = backend
                .read_time_series_selected(txn, &[target.clone()], range, bad)
                .unwrap_err();
            assert!(matches!(err, FsError::Storage(StorageError::InvalidRange { .. })));
        }
        backend.rollback(txn).unwrap();
    }

    fn mjd_points(id: &FsId, start: f64, end: f64, times: &[f64], origin: u64) -> MjdTimeSeries {
        let values = times.iter().map(|t| (*t as f32) * 2.0).collect();
        MjdTimeSeries::new(id.clone(), start, end, times.to_vec(), values, vec![origin; times.len()]).unwrap()
    }

    #[test]
    fn test_mjd_series_stage_merge_and_commit() {
        let dir = tempdir().unwrap();
        let target = id("/dv/mjd/ra");
        {
            let backend = open(dir.path());
            let txn = backend.begin("t").unwrap();
            backend
                .write_mjd_time_series(txn, &mjd_points(&target, 100.0, 110.0, &[100.0, 105.5, 110.0], 1), false)
                .unwrap();
            backend
                .write_mjd_time_series(txn, &mjd_points(&target, 105.5, 120.0, &[105.5, 120.0], 2), false)
                .unwrap();

            let other = backend.begin("o").unwrap();
            let unseen = backend.read_mjd_time_series(other, &[target.clone()], 0.0, 200.0).unwrap();
            assert!(!unseen[0].exists());
            let err = backend
                .write_mjd_time_series(other, &mjd_points(&target, 0.0, 1.0, &[0.5], 9), false)
                .unwrap_err();
            assert!(matches!(err, FsError::Transaction(TransactionError::WriteConflict { .. })));
            backend.rollback(other).unwrap();

            let staged = backend.read_mjd_time_series(txn, &[target.clone()], 101.0, 200.0).unwrap();
            assert_eq!(staged[0].mjd(), &[105.5, 110.0, 120.0]);
            assert_eq!(staged[0].originators(), &[2, 1, 2]);
            backend.commit_local(txn).unwrap();
        }

        let backend = open(dir.path());
        assert_eq!(backend.find_mjd_ids("/dv/").unwrap(), vec![target.clone()]);
        assert_eq!(backend.find_ids("/dv/").unwrap(), vec![target.clone()]);
        let txn = backend.begin("t").unwrap();
        let read = backend.read_mjd_time_series(txn, &[target.clone()], 100.0, 120.0).unwrap();
        assert!(read[0].exists());
        assert_eq!(read[0].mjd(), &[100.0, 105.5, 110.0, 120.0]);
        assert_eq!(read[0].values(), &[200.0, 211.0, 220.0, 240.0]);
        backend.rollback(txn).unwrap();
    }

    #[test]
    fn test_mjd_overwrite_truncates_and_delete_hides() {
        let dir = tempdir().unwrap();
        let backend = open(dir.path());
        let target = id("/dv/mjd/dec");
        let txn = backend.begin("t").unwrap();
        backend
            .write_mjd_time_series(txn, &mjd_points(&target, 0.0, 10.0, &[1.0, 4.0, 8.0], 1), false)
            .unwrap();
        backend.commit_local(txn).unwrap();

        let txn = backend.begin("t").unwrap();
        backend
            .write_mjd_time_series(txn, &mjd_points(&target, 3.0, 10.0, &[], 2), true)
            .unwrap();
        let read = backend.read_mjd_time_series(txn, &[target.clone()], 0.0, 10.0).unwrap();
        assert_eq!(read[0].mjd(), &[1.0]);
        backend.commit_local(txn).unwrap();

        let txn = backend.begin("t").unwrap();
        backend.delete_mjd_time_series(txn, &target).unwrap();
        let read = backend.read_mjd_time_series(txn, &[target.clone()], 0.0, 10.0).unwrap();
        assert!(!read[0].exists());
        assert!(backend.delete_mjd_time_series(txn, &target).unwrap_err().is_not_found());
        backend.commit_local(txn).unwrap();
        assert!(backend.find_mjd_ids("/").unwrap().is_empty());

        let txn = backend.begin("t").unwrap();
        let missing = MjdTimeSeries::non_existent(target.clone(), 0.0, 1.0);
        assert!(backend.write_mjd_time_series(txn, &missing, false).is_err());
        for (start, end) in [(5.0, 1.0), (f64::NAN, 1.0)] {
            let err = backend
                .read_mjd_time_series(txn, &[target.clone()], start, end)
                .unwrap_err();
            assert!(matches!(err, FsError::Storage(StorageError::InvalidMjdRange { .. })));
        }
        backend.rollback(txn).unwrap();
    }
}
