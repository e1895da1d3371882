//! # lanefs
//!
//! Transactional, lane-multiplexed time-series and blob storage engine.
//!
//! lanefs stores very large numbers of small dense time series and opaque
//! blobs under hierarchical ids. Each series owns one lane of a shared
//! container file, so millions of series live in a bounded number of files.
//! Every change happens inside a transaction that is journalled before it
//! touches storage and replayed or discarded after a crash.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Many series multiplexed into one file through interleaved lanes
//! - Gap-aware merges that never clobber existing data under a write's gaps
//! - Redo journal with a single durable commit point per transaction
//! - Bounded directory fanout through deterministic directory hashing
//! - Admission control that sizes batch fan-out to free capacity
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lanefs::{DataType, FsId, SeriesData, SeriesRange, TimeSeries, TransactionalBackend};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = TransactionalBackend::open("./my_store")?;
//!
//! // Write four cadences of flux, the third one missing
//! let id = FsId::parse("/pa/target/123/flux")?;
//! let txn = backend.begin("pipeline-host")?;
//! let flux = TimeSeries::from_gaps(
//!     id.clone(),
//!     1000,
//!     SeriesData::Float(vec![1.0, 1.1, 0.0, 1.3]),
//!     &[false, false, true, false],
//!     42,
//! )?;
//! backend.write_time_series(txn, &flux, false)?;
//! backend.commit_local(txn)?;
//!
//! // Read it back with NaN in the gap
//! let txn = backend.begin("pipeline-host")?;
//! let range = SeriesRange::new(1000, 1003, DataType::Float).with_fill(f64::NAN);
//! let series = backend.read_time_series(txn, &[id], range)?;
//! println!("{}", series[0].to_pipe_string());
//! backend.rollback(txn)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`backend`]: Transactions, series and blob operations, recovery
//! - [`id`]: Hierarchical identifiers
//! - [`interval`]: Interval sets and merge semantics
//! - [`filter`]: Clipping interval lists to selected positions
//! - [`merge`]: Splitting writes into gap-safe chunks
//! - [`series`]: Time series values, pipe strings, binary transfer
//! - [`mjd`]: Irregularly sampled series keyed by Modified Julian Date
//! - [`lane`]: Lane-multiplexed container files
//! - [`allocator`]: Lane assignment
//! - [`index`]: Persistent id to lane index
//! - [`dirhash`]: Directory hashing of files
//! - [`blob`]: Whole-file blob storage
//! - [`journal`]: Redo journal and transaction status logs
//! - [`txn`]: Transaction lifecycle and write claims
//! - [`throttle`]: Admission control
//! - [`sequence`]: Durable monotonic counters
//! - [`mapped`]: Memory-mapped file access
//! - [`extent`]: Allocated extents of sparse files
//! - [`config`]: Store and placement configuration
//! - [`error`]: Error types

pub mod allocator;
pub mod backend;
pub mod blob;
pub mod config;
pub mod dirhash;
pub mod error;
pub mod extent;
pub mod filter;
pub mod id;
pub mod index;
pub mod interval;
pub mod journal;
pub mod lane;
pub mod mapped;
pub mod merge;
pub mod mjd;
pub mod sequence;
pub mod series;
pub mod throttle;
pub mod txn;

// Re-export primary API types at crate root for convenience.
pub use backend::{RecoveryReport, SeriesMetadata, SeriesRange, TransactionalBackend};
pub use blob::Blob;
pub use config::{PlacementConfig, StoreConfig};
pub use error::{FsError, Result};
pub use id::FsId;
pub use interval::{Interval, IntervalSet, TaggedInterval};
pub use mjd::MjdTimeSeries;
pub use series::{DataType, SeriesData, TimeSeries};
pub use throttle::Throttle;
pub use txn::{TxnId, TxnState};
