//! Transaction bookkeeping.
//!
//! The [`TransactionManager`] owns the lifecycle of every live transaction:
//! its state, the changes it has staged in memory, and the write claims that
//! keep two transactions from changing the same id. It also owns the
//! journal and status log files, so it decides what is durable when. The
//! backend applies staged changes to storage; this module never touches
//! containers or blobs.
//!
//! ```text
//! Active ──prepare──▶ Prepared ──commit──▶ Committing ──apply──▶ Committed
//!   │                    │
//!   └──────rollback──────┴──────────────▶ RolledBack
//! ```
//!
//! A transaction that fails while applying stays `Committing`: its journal
//! is kept and it can only be committed again or replayed by recovery.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError, TransactionError};
use crate::id::FsId;
use crate::index::Location;
use crate::interval::{Interval, IntervalSet, TaggedInterval};
use crate::journal::{read_journal, remove_if_exists, JournalRecord, JournalWriter, LogState, TxnLog};
use crate::mjd::MjdPoints;
use crate::sequence::PersistentSequence;
use crate::series::{DataType, SeriesData};

const TXN_SEQUENCE_FILE: &str = "txn.seq";
const JOURNAL_EXT: &str = "journal";
const LOG_EXT: &str = "log";

/// Outcomes of finished transactions kept for [`TransactionManager::state`].
const FINISHED_HISTORY: usize = 4096;

/// Identifies a transaction: the host that began it plus a number unique
/// within the storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId {
    local: u64,
    host: u32,
}

impl TxnId {
    fn new(host: &str, local: u64) -> Self {
        Self {
            local,
            host: host_identity(host),
        }
    }

    /// The locally generated transaction number.
    pub fn local(self) -> u64 {
        self.local
    }

    /// Identity of the host that began the transaction.
    pub fn host(self) -> u32 {
        self.host
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}@{:08x}", self.local, self.host)
    }
}

/// Stable identity of a host name.
pub fn host_identity(host: &str) -> u32 {
    crc32fast::hash(host.as_bytes())
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// Accepting reads and writes.
    Active,
    /// Journal durable, outcome undecided.
    Prepared,
    /// Past the commit point but not yet fully applied.
    Committing,
    /// Changes applied and visible. Terminal.
    Committed,
    /// Changes discarded. Terminal.
    RolledBack,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::Active => "active",
            TxnState::Prepared => "prepared",
            TxnState::Committing => "committing",
            TxnState::Committed => "committed",
            TxnState::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// Values staged for one series.
#[derive(Debug, Clone)]
pub(crate) struct PendingSeries {
    pub data_type: DataType,
    /// Lane the values go to. After a staged delete this is a fresh lane
    /// the index does not know about until commit.
    pub location: Location,
    /// Physical writes in the order they were staged: first position and
    /// the values from there.
    pub writes: Vec<(i64, SeriesData)>,
    /// Valid positions once the transaction commits.
    pub valid: IntervalSet<Interval>,
    /// Originators once the transaction commits.
    pub originators: IntervalSet<TaggedInterval>,
}

/// A staged series change.
#[derive(Debug, Clone)]
pub(crate) enum SeriesOp {
    Write(PendingSeries),
    Delete,
}

/// A staged blob change.
#[derive(Debug, Clone)]
pub(crate) enum BlobOp {
    Put { origin: u64, bytes: Vec<u8> },
    Delete,
}

/// A staged change to an irregularly sampled series.
#[derive(Debug, Clone)]
pub(crate) enum MjdOp {
    Put(MjdPoints),
    Delete,
}

/// One live transaction.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub id: TxnId,
    pub host: String,
    pub state: TxnState,
    pub series: BTreeMap<FsId, SeriesOp>,
    pub blobs: BTreeMap<FsId, BlobOp>,
    pub mjd: BTreeMap<FsId, MjdOp>,
}

impl Transaction {
    /// The redo records that reproduce every staged change.
    pub fn journal_records(&self) -> Vec<JournalRecord> {
        let mut records = Vec::new();
        for (id, op) in &self.series {
            match op {
                SeriesOp::Write(pending) => {
                    for (position, data) in &pending.writes {
                        records.push(JournalRecord::SeriesWrite {
                            id: id.clone(),
                            assignment: pending.location.assignment,
                            data_type: pending.data_type,
                            position: *position,
                            bytes: data.to_le_bytes(),
                        });
                    }
                    records.push(JournalRecord::SeriesMeta {
                        id: id.clone(),
                        assignment: pending.location.assignment,
                        data_type: pending.data_type,
                        valid: pending.valid.clone(),
                        originators: pending.originators.clone(),
                    });
                }
                SeriesOp::Delete => records.push(JournalRecord::SeriesDelete { id: id.clone() }),
            }
        }
        for (id, op) in &self.blobs {
            records.push(match op {
                BlobOp::Put { origin, bytes } => JournalRecord::BlobPut {
                    id: id.clone(),
                    origin: *origin,
                    bytes: bytes.clone(),
                },
                BlobOp::Delete => JournalRecord::BlobDelete { id: id.clone() },
            });
        }
        for (id, op) in &self.mjd {
            records.push(match op {
                MjdOp::Put(points) => JournalRecord::MjdPut {
                    id: id.clone(),
                    bytes: points.encode(),
                },
                MjdOp::Delete => JournalRecord::MjdDelete { id: id.clone() },
            });
        }
        records
    }

    /// Series ids this transaction allocated storage for.
    pub fn staged_series_ids(&self) -> impl Iterator<Item = &FsId> {
        self.series.keys()
    }

    fn invalid_state(&self, operation: &'static str) -> TransactionError {
        TransactionError::InvalidState {
            id: self.id.to_string(),
            state: self.state.to_string(),
            operation,
        }
    }
}

/// Whose write claim an id is under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ClaimKey {
    Series,
    Blob,
    Mjd,
}

/// Outcomes of the most recently finished transactions, oldest evicted
/// first.
#[derive(Debug)]
struct Outcomes {
    order: VecDeque<TxnId>,
    states: HashMap<TxnId, TxnState>,
    capacity: usize,
}

impl Outcomes {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            states: HashMap::new(),
            capacity,
        }
    }

    fn get(&self, txn: &TxnId) -> Option<&TxnState> {
        self.states.get(txn)
    }

    fn record(&mut self, txn: TxnId, state: TxnState) {
        if self.states.insert(txn, state).is_none() {
            self.order.push_back(txn);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }
}

#[derive(Debug)]
struct Registry {
    live: HashMap<TxnId, Transaction>,
    claims: HashMap<(ClaimKey, FsId), TxnId>,
    finished: Outcomes,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            live: HashMap::new(),
            claims: HashMap::new(),
            finished: Outcomes::with_capacity(FINISHED_HISTORY),
        }
    }
}

impl Registry {
    fn get_mut(&mut self, txn: TxnId) -> Result<&mut Transaction> {
        if let Some(state) = self.finished.get(&txn) {
            return Err(TransactionError::InvalidState {
                id: txn.to_string(),
                state: state.to_string(),
                operation: "use",
            }
            .into());
        }
        self.live.get_mut(&txn).ok_or_else(|| {
            TransactionError::UnknownTransaction {
                id: txn.to_string(),
            }
            .into()
        })
    }

    fn release_claims(&mut self, txn: TxnId) {
        self.claims.retain(|_, holder| *holder != txn);
    }
}

/// A transaction found on disk when the store was opened.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredTxn {
    /// Transaction number.
    pub txn: u64,
    /// Last recorded state.
    pub state: LogState,
    /// The redo records, read only for transactions that reached
    /// [`LogState::Committing`].
    pub records: Option<Vec<JournalRecord>>,
}

/// Tracks the live transactions of one storage root.
#[derive(Debug)]
pub struct TransactionManager {
    dir: PathBuf,
    sequence: PersistentSequence,
    registry: Mutex<Registry>,
}

impl TransactionManager {
    /// Opens the transaction directory `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory or sequence cannot be
    /// created.
    pub fn open(dir: &Path, sequence_reserve: u64) -> Result<Self> {
        crate::dirhash::create_dir_retrying(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            sequence: PersistentSequence::open(&dir.join(TXN_SEQUENCE_FILE), sequence_reserve)?,
            registry: Mutex::new(Registry::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn journal_path(&self, txn: u64) -> PathBuf {
        self.dir.join(format!("{txn:016x}.{JOURNAL_EXT}"))
    }

    fn log_path(&self, txn: u64) -> PathBuf {
        self.dir.join(format!("{txn:016x}.{LOG_EXT}"))
    }

    /// Starts a transaction on behalf of `host`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the id sequence cannot be advanced.
    pub fn begin(&self, host: &str) -> Result<TxnId> {
        let id = TxnId::new(host, self.sequence.next()?);
        self.lock().live.insert(
            id,
            Transaction {
                id,
                host: host.to_string(),
                state: TxnState::Active,
                series: BTreeMap::new(),
                blobs: BTreeMap::new(),
                mjd: BTreeMap::new(),
            },
        );
        debug!(txn = %id, host, "began transaction");
        Ok(id)
    }

    /// Current state of `txn`. Only the most recent outcomes are kept, so a
    /// transaction that finished long ago reads as unknown.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::UnknownTransaction`] for ids this manager
    /// never issued or has forgotten.
    pub fn state(&self, txn: TxnId) -> Result<TxnState> {
        let registry = self.lock();
        if let Some(state) = registry.finished.get(&txn) {
            return Ok(*state);
        }
        registry.live.get(&txn).map(|t| t.state).ok_or_else(|| {
            TransactionError::UnknownTransaction {
                id: txn.to_string(),
            }
            .into()
        })
    }

    /// Ids of live transactions.
    pub fn live(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.lock().live.keys().copied().collect();
        ids.sort();
        ids
    }

    fn claim(&self, txn: TxnId, key: ClaimKey, id: &FsId, operation: &'static str) -> Result<()> {
        let mut registry = self.lock();
        let transaction = registry.get_mut(txn)?;
        if transaction.state != TxnState::Active {
            return Err(transaction.invalid_state(operation).into());
        }
        match registry.claims.get(&(key, id.clone())) {
            Some(holder) if *holder != txn => Err(TransactionError::WriteConflict {
                fs_id: id.to_string(),
                holder: holder.to_string(),
            }
            .into()),
            Some(_) => Ok(()),
            None => {
                registry.claims.insert((key, id.clone()), txn);
                Ok(())
            }
        }
    }

    /// Takes the write claim on series `id` for `txn`.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::WriteConflict`] if another transaction
    /// holds the claim and [`TransactionError::InvalidState`] if `txn` is not
    /// active.
    pub(crate) fn claim_series(&self, txn: TxnId, id: &FsId, operation: &'static str) -> Result<()> {
        self.claim(txn, ClaimKey::Series, id, operation)
    }

    /// Takes the write claim on blob `id` for `txn`.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionManager::claim_series`].
    pub(crate) fn claim_blob(&self, txn: TxnId, id: &FsId, operation: &'static str) -> Result<()> {
        self.claim(txn, ClaimKey::Blob, id, operation)
    }

    /// Takes the write claim on irregularly sampled series `id` for `txn`.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionManager::claim_series`].
    pub(crate) fn claim_mjd(&self, txn: TxnId, id: &FsId, operation: &'static str) -> Result<()> {
        self.claim(txn, ClaimKey::Mjd, id, operation)
    }

    /// Runs `f` on an active transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::InvalidState`] if `txn` is not active,
    /// otherwise whatever `f` returns.
    pub(crate) fn with_active<R>(
        &self,
        txn: TxnId,
        operation: &'static str,
        f: impl FnOnce(&mut Transaction) -> Result<R>,
    ) -> Result<R> {
        let mut registry = self.lock();
        let transaction = registry.get_mut(txn)?;
        if transaction.state != TxnState::Active {
            return Err(transaction.invalid_state(operation).into());
        }
        f(transaction)
    }

    /// Runs `f` on a transaction that can still read: active or prepared.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::InvalidState`] for finished transactions.
    pub(crate) fn with_readable<R>(&self, txn: TxnId, f: impl FnOnce(&Transaction) -> R) -> Result<R> {
        let mut registry = self.lock();
        let transaction = registry.get_mut(txn)?;
        Ok(f(transaction))
    }

    /// Makes `txn` durable as `Prepared`: writes and fsyncs its journal,
    /// runs `before_log` (the backend flushes its index there), then writes
    /// the status log. On failure the transaction is active again.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::InvalidState`] unless `txn` is active,
    /// and any I/O error from the journal, log or `before_log`.
    pub(crate) fn prepare(&self, txn: TxnId, before_log: impl FnOnce() -> Result<()>) -> Result<()> {
        let (records, host) = {
            let mut registry = self.lock();
            let transaction = registry.get_mut(txn)?;
            if transaction.state != TxnState::Active {
                return Err(transaction.invalid_state("prepare").into());
            }
            transaction.state = TxnState::Prepared;
            (transaction.journal_records(), transaction.host.clone())
        };

        let result = self.write_prepared(txn, &records, &host, before_log);
        if let Err(e) = &result {
            warn!(txn = %txn, error = %e, "prepare failed, transaction stays active");
            let _ = remove_if_exists(&self.journal_path(txn.local));
            if let Ok(transaction) = self.lock().get_mut(txn) {
                transaction.state = TxnState::Active;
            }
        }
        result
    }

    fn write_prepared(
        &self,
        txn: TxnId,
        records: &[JournalRecord],
        host: &str,
        before_log: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let mut journal = JournalWriter::create(&self.journal_path(txn.local))?;
        for record in records {
            journal.append(record)?;
        }
        journal.finish()?;
        before_log()?;
        TxnLog {
            txn: txn.local,
            host: host.to_string(),
            state: LogState::Prepared,
        }
        .write(&self.log_path(txn.local))?;
        debug!(txn = %txn, records = records.len(), "prepared");
        Ok(())
    }

    /// Passes the commit point of a prepared transaction and returns the
    /// records to apply. A transaction already `Committing` after a failed
    /// apply gets its records again.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::InvalidState`] unless `txn` is prepared
    /// or committing, and [`StorageError::Io`] if the log cannot be written.
    pub(crate) fn begin_commit(&self, txn: TxnId) -> Result<Vec<JournalRecord>> {
        let (records, host) = {
            let mut registry = self.lock();
            let transaction = registry.get_mut(txn)?;
            match transaction.state {
                TxnState::Committing => return Ok(transaction.journal_records()),
                TxnState::Prepared => {}
                _ => return Err(transaction.invalid_state("commit").into()),
            }
            (transaction.journal_records(), transaction.host.clone())
        };
        TxnLog {
            txn: txn.local,
            host,
            state: LogState::Committing,
        }
        .write(&self.log_path(txn.local))?;
        if let Ok(transaction) = self.lock().get_mut(txn) {
            transaction.state = TxnState::Committing;
        }
        Ok(records)
    }

    /// Retires a transaction whose records have been applied.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if its files cannot be removed.
    pub(crate) fn finish_commit(&self, txn: TxnId) -> Result<()> {
        self.discard_files(txn.local)?;
        let mut registry = self.lock();
        registry.live.remove(&txn);
        registry.release_claims(txn);
        registry.finished.record(txn, TxnState::Committed);
        info!(txn = %txn, "committed");
        Ok(())
    }

    /// Discards an active or prepared transaction, returning what it had
    /// staged so the caller can release storage it allocated.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::InvalidState`] for finished transactions
    /// and for transactions past the commit point, and [`StorageError::Io`]
    /// if its files cannot be removed.
    pub(crate) fn rollback(&self, txn: TxnId) -> Result<Transaction> {
        let mut transaction = {
            let mut registry = self.lock();
            registry.get_mut(txn).map_err(|e| match e {
                crate::FsError::Transaction(TransactionError::InvalidState { id, state, .. }) => {
                    crate::FsError::from(TransactionError::InvalidState {
                        id,
                        state,
                        operation: "roll back",
                    })
                }
                other => other,
            })?;
            if let Some(committing) = registry.live.get(&txn).filter(|t| t.state == TxnState::Committing) {
                return Err(committing.invalid_state("roll back").into());
            }
            let Some(transaction) = registry.live.remove(&txn) else {
                return Err(TransactionError::UnknownTransaction {
                    id: txn.to_string(),
                }
                .into());
            };
            registry.release_claims(txn);
            registry.finished.record(txn, TxnState::RolledBack);
            transaction
        };
        self.discard_files(txn.local)?;
        transaction.state = TxnState::RolledBack;
        info!(txn = %txn, "rolled back");
        Ok(transaction)
    }

    /// Removes the journal and log of transaction number `txn`. The log
    /// goes last so a crash in between still finds it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if removal fails.
    pub fn discard_files(&self, txn: u64) -> Result<()> {
        remove_if_exists(&self.journal_path(txn))?;
        remove_if_exists(&self.log_path(txn))
    }

    /// Every transaction left on disk by an earlier process, in number
    /// order. Journals without a log never reached `Prepared` and are
    /// deleted here.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptState`] for unreadable logs or damaged
    /// journals of committing transactions.
    pub fn recover(&self) -> Result<Vec<RecoveredTxn>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        let mut logs = Vec::new();
        let mut journals = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StorageError::io(&self.dir, e))?.path();
            let number = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| u64::from_str_radix(s, 16).ok());
            let Some(number) = number else { continue };
            match path.extension().and_then(|e| e.to_str()) {
                Some(LOG_EXT) => logs.push(number),
                Some(JOURNAL_EXT) => journals.push(number),
                _ => {}
            }
        }
        logs.sort_unstable();

        for orphan in journals.iter().filter(|j| logs.binary_search(j).is_err()) {
            warn!(txn = orphan, "removing journal of unprepared transaction");
            remove_if_exists(&self.journal_path(*orphan))?;
        }

        let mut found = Vec::with_capacity(logs.len());
        for txn in logs {
            let log = TxnLog::read(&self.log_path(txn))?;
            let records = match log.state {
                LogState::Committing => Some(read_journal(&self.journal_path(txn))?),
                LogState::Prepared => None,
            };
            found.push(RecoveredTxn {
                txn,
                state: log.state,
                records,
            });
        }
        Ok(found)
    }
}
