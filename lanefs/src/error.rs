//! Error types for the lanefs storage engine.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all lanefs operations.
///
/// Each variant wraps a per-concern error enum so callers can either match
/// on the broad category or drill into the specific failure.
#[derive(Error, Debug)]
pub enum FsError {
    /// An identifier failed to parse or decode.
    #[error("identifier error: {0}")]
    Id(#[from] IdError),

    /// Storage layer failure (missing ids, corruption, I/O).
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Throttle permit acquisition failed.
    #[error("throttle error: {0}")]
    Throttle(#[from] ThrottleError),

    /// Transaction state machine violation or conflict.
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// Textual or binary interchange format was malformed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl FsError {
    /// Returns `true` if this error reports an identifier with no storage.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::Storage(StorageError::NotFound { .. }))
    }

    /// Returns `true` if this error reports on-disk state that is
    /// inconsistent and requires offline repair.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, FsError::Storage(StorageError::CorruptState { .. }))
    }
}

/// Errors produced while parsing identifiers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier text does not follow `/path/segments/name` syntax.
    #[error("malformed identifier '{input}': {reason}")]
    Malformed {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors from the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The identifier has no storage location.
    #[error("no storage for '{id}'")]
    NotFound {
        /// The identifier that was looked up.
        id: String,
    },

    /// On-disk structures are inconsistent. Never corrected automatically.
    #[error("corrupt state in '{}': {reason}", path.display())]
    CorruptState {
        /// The file or directory holding the inconsistent structure.
        path: PathBuf,
        /// Description of the inconsistency.
        reason: String,
    },

    /// An I/O operation failed.
    #[error("I/O failure on '{}': {source}", path.display())]
    Io {
        /// The file or directory being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A chunk iterator was advanced past its end.
    #[error("no more chunks")]
    NoMoreChunks,

    /// A series value buffer and its intervals disagree.
    #[error("invalid series '{id}': {reason}")]
    InvalidSeries {
        /// The series id.
        id: String,
        /// Description of the inconsistency.
        reason: String,
    },

    /// A position range is reversed or negative.
    #[error("invalid position range [{start}, {end}]")]
    InvalidRange {
        /// First position.
        start: i64,
        /// Last position.
        end: i64,
    },

    /// A time range is reversed or not a number.
    #[error("invalid time range [{start}, {end}]")]
    InvalidMjdRange {
        /// First time.
        start: f64,
        /// Last time.
        end: f64,
    },

    /// A read or write used a different element type than the series holds.
    #[error("series '{id}' holds {stored} values, not {requested}")]
    TypeMismatch {
        /// The series id.
        id: String,
        /// Type the series holds.
        stored: &'static str,
        /// Type of the rejected access.
        requested: &'static str,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        let path = path.into();
        let reason = reason.into();
        tracing::error!(path = %path.display(), %reason, "corrupt storage state");
        StorageError::CorruptState { path, reason }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Two placement prefixes overlap, so an id could map to either root.
    #[error("ambiguous placement: prefix '{first}' overlaps '{second}'")]
    AmbiguousPlacement {
        /// The first overlapping prefix.
        first: String,
        /// The second overlapping prefix.
        second: String,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Description of the bad value.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read configuration '{}': {source}", path.display())]
    Io {
        /// The configuration file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected shape.
    #[error("failed to parse configuration '{}': {source}", path.display())]
    Parse {
        /// The configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by the admission-control throttle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThrottleError {
    /// The wait for permits was cancelled. No permits are held.
    #[error("permit wait interrupted")]
    Interrupted,

    /// The request can never be satisfied by this throttle.
    #[error("requested {requested} permits but throttle total is {total}")]
    Unsatisfiable {
        /// Permits requested.
        requested: usize,
        /// Throttle capacity.
        total: usize,
    },
}

/// Errors raised by the transaction coordinator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// The operation needs a different transaction state.
    #[error("transaction {id} is {state}; cannot {operation}")]
    InvalidState {
        /// The transaction id.
        id: String,
        /// The current state.
        state: String,
        /// The attempted operation.
        operation: &'static str,
    },

    /// The transaction id is not known to this coordinator.
    #[error("unknown transaction {id}")]
    UnknownTransaction {
        /// The transaction id.
        id: String,
    },

    /// Another live transaction already writes this identifier.
    #[error("'{fs_id}' is being written by transaction {holder}")]
    WriteConflict {
        /// The contested identifier.
        fs_id: String,
        /// The transaction holding the write claim.
        holder: String,
    },
}

/// Errors from the interchange formats.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A pipe-delimited string could not be parsed.
    #[error("bad pipe string field {field}: {reason}")]
    PipeString {
        /// Zero-based field index.
        field: usize,
        /// Description of the problem.
        reason: String,
    },

    /// A binary frame was truncated or inconsistent.
    #[error("bad binary frame: {reason}")]
    Frame {
        /// Description of the problem.
        reason: String,
    },

    /// The underlying stream failed.
    #[error("stream failure: {0}")]
    Stream(#[from] std::io::Error),
}

/// Type alias for `Result<T, FsError>`.
pub type Result<T> = std::result::Result<T, FsError>;
