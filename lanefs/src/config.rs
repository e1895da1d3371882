//! Store and placement configuration.
//!
//! Both files are optional JSON documents in the data directory:
//!
//! - `lanefs.json` holds [`StoreConfig`]. Missing fields take their defaults.
//! - `fsdataroots.json` holds the [`PlacementConfig`] prefix table that moves
//!   parts of the id space onto other physical roots.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::id::FsId;

/// File name of the store configuration inside a data directory.
pub const STORE_CONFIG_FILE: &str = "lanefs.json";

/// File name of the placement table inside a data directory.
pub const PLACEMENT_CONFIG_FILE: &str = "fsdataroots.json";

/// Hard upper bound on lanes multiplexed into one container file.
pub const MAX_LANES_PER_FILE: u32 = 256;

/// Tunables for one storage root.
///
/// # Example
///
/// ```rust
/// use lanefs::config::StoreConfig;
///
/// let config = StoreConfig {
///     lanes_per_file: 8,
///     lane_block_size: 4096,
///     ..StoreConfig::default()
/// };
/// config.validate()?;
/// # Ok::<(), lanefs::FsError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Leaf fanout of every directory hash.
    pub max_files_per_dir: u32,

    /// Number of files each directory hash is sized for.
    pub files_per_store: u64,

    /// Lanes interleaved into one container file.
    pub lanes_per_file: u32,

    /// Interleave granularity in bytes.
    pub lane_block_size: u64,

    /// Bytes reserved at the start of every container file.
    pub container_header_size: u64,

    /// Values reserved per persistent-sequence flush.
    pub sequence_reserve: u64,

    /// Total throttle permits.
    pub throttle_total: usize,

    /// Minimum permits a greedy acquisition waits for. Also the cost of a
    /// read permit.
    pub throttle_min_greedy: usize,

    /// Divisor applied to the remaining permits by a greedy acquisition.
    pub throttle_max_greedy: usize,

    /// Fsync container files during commit.
    pub sync_on_commit: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_files_per_dir: 1000,
            files_per_store: 1_000_000,
            lanes_per_file: 64,
            lane_block_size: 65536,
            container_header_size: 64,
            sequence_reserve: 1000,
            throttle_total: 16,
            throttle_min_greedy: 1,
            throttle_max_greedy: 2,
            sync_on_commit: true,
        }
    }
}

impl StoreConfig {
    /// Loads `lanefs.json` from `data_dir`, falling back to defaults if the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, does not parse, or
    /// fails [`StoreConfig::validate`].
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(STORE_CONFIG_FILE);
        let config = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|source| ConfigError::Parse { path, source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => return Err(ConfigError::Io { path, source }.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Writes this configuration as `lanefs.json` in `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be written.
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(STORE_CONFIG_FILE);
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| ConfigError::Io { path, source })?;
        Ok(())
    }

    /// Checks every value is in range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> Result<()> { Err(ConfigError::Invalid { reason }.into()) };

        if self.lanes_per_file == 0 || self.lanes_per_file > MAX_LANES_PER_FILE {
            return invalid(format!(
                "lanes_per_file must be in 1..={MAX_LANES_PER_FILE}, got {}",
                self.lanes_per_file
            ));
        }
        if self.lane_block_size == 0 {
            return invalid("lane_block_size must be non-zero".to_string());
        }
        if self.container_header_size < crate::lane::CONTAINER_HEADER_MIN {
            return invalid(format!(
                "container_header_size must be at least {}, got {}",
                crate::lane::CONTAINER_HEADER_MIN,
                self.container_header_size
            ));
        }
        if self.max_files_per_dir < 2 {
            return invalid(format!(
                "max_files_per_dir must be at least 2, got {}",
                self.max_files_per_dir
            ));
        }
        if self.files_per_store < 1 {
            return invalid("files_per_store must be at least 1".to_string());
        }
        if self.sequence_reserve == 0 {
            return invalid("sequence_reserve must be non-zero".to_string());
        }
        if self.throttle_min_greedy == 0 || self.throttle_max_greedy == 0 {
            return invalid("throttle greedy bounds must be non-zero".to_string());
        }
        if self.throttle_min_greedy > self.throttle_total {
            return invalid(format!(
                "throttle_min_greedy {} exceeds throttle_total {}",
                self.throttle_min_greedy, self.throttle_total
            ));
        }
        Ok(())
    }
}

/// One row of the placement table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementEntry {
    /// Id path prefix, starting and ending with `/`.
    pub prefix: String,
    /// Physical root that ids under `prefix` live in.
    pub root: PathBuf,
}

/// Maps id path prefixes onto physical data roots.
///
/// At most one entry matches any id. Overlapping prefixes are rejected when
/// the table is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementConfig {
    default_root: PathBuf,
    entries: Vec<PlacementEntry>,
}

impl PlacementConfig {
    /// A table with no entries. Every id lives under `default_root`.
    pub fn single_root(default_root: impl Into<PathBuf>) -> Self {
        Self {
            default_root: default_root.into(),
            entries: Vec::new(),
        }
    }

    /// Builds a table, rejecting malformed or ambiguous prefixes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a malformed prefix and
    /// [`ConfigError::AmbiguousPlacement`] if one prefix is a prefix of
    /// another.
    pub fn new(default_root: impl Into<PathBuf>, entries: Vec<PlacementEntry>) -> Result<Self> {
        for entry in &entries {
            if !entry.prefix.starts_with('/') || !entry.prefix.ends_with('/') {
                return Err(ConfigError::Invalid {
                    reason: format!("placement prefix '{}' must start and end with '/'", entry.prefix),
                }
                .into());
            }
        }
        for (i, a) in entries.iter().enumerate() {
            for b in &entries[i + 1..] {
                if a.prefix.starts_with(&b.prefix) || b.prefix.starts_with(&a.prefix) {
                    return Err(ConfigError::AmbiguousPlacement {
                        first: a.prefix.clone(),
                        second: b.prefix.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(Self {
            default_root: default_root.into(),
            entries,
        })
    }

    /// Loads `fsdataroots.json` from `data_dir`. A missing file yields a
    /// single-root table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or the
    /// table is ambiguous.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(PLACEMENT_CONFIG_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => {
                let entries: Vec<PlacementEntry> = serde_json::from_str(&text)
                    .map_err(|source| ConfigError::Parse { path, source })?;
                Self::new(data_dir, entries)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::single_root(data_dir)),
            Err(source) => Err(ConfigError::Io { path, source }.into()),
        }
    }

    /// The physical root holding `id`.
    pub fn root_for(&self, id: &FsId) -> &Path {
        self.entries
            .iter()
            .find(|e| id.path().starts_with(&e.prefix))
            .map_or(self.default_root.as_path(), |e| e.root.as_path())
    }

    /// Every distinct physical root, default first.
    pub fn roots(&self) -> Vec<&Path> {
        let mut roots = vec![self.default_root.as_path()];
        for entry in &self.entries {
            if !roots.contains(&entry.root.as_path()) {
                roots.push(&entry.root);
            }
        }
        roots
    }

    /// The configured entries.
    pub fn entries(&self) -> &[PlacementEntry] {
        &self.entries
    }
}
