//! Lane assignment from a persistent sequence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::MAX_LANES_PER_FILE;
use crate::error::{ConfigError, Result};
use crate::sequence::PersistentSequence;

/// Where a series' bytes live: one lane of one container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LaneAssignment {
    /// Container file number.
    pub file: u64,
    /// Lane within the container.
    pub lane: u32,
}

/// Hands out unique `(file, lane)` pairs.
///
/// Sequence value `s` maps to file `s / lanes_per_file` and lane
/// `s % lanes_per_file`, so concurrent callers racing on the sequence still
/// receive distinct pairs.
#[derive(Debug)]
pub struct LaneAllocator {
    sequence: PersistentSequence,
    lanes_per_file: u32,
}

impl LaneAllocator {
    /// Opens the allocator whose sequence lives at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `lanes_per_file` is 0 or above
    /// 256, and sequence errors from [`PersistentSequence::open`].
    pub fn open(path: &Path, lanes_per_file: u32, reserve: u64) -> Result<Self> {
        if lanes_per_file == 0 || lanes_per_file > MAX_LANES_PER_FILE {
            return Err(ConfigError::Invalid {
                reason: format!("lanes_per_file must be in 1..={MAX_LANES_PER_FILE}, got {lanes_per_file}"),
            }
            .into());
        }
        Ok(Self {
            sequence: PersistentSequence::open(path, reserve)?,
            lanes_per_file,
        })
    }

    /// Allocates a fresh lane.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence reservation cannot be persisted.
    pub fn allocate_lane(&self) -> Result<LaneAssignment> {
        let value = self.sequence.next()?;
        Ok(self.assignment_for(value))
    }

    fn assignment_for(&self, value: u64) -> LaneAssignment {
        let per_file = u64::from(self.lanes_per_file);
        #[allow(clippy::cast_possible_truncation)] // remainder < lanes_per_file <= 256
        let lane = (value % per_file) as u32;
        LaneAssignment {
            file: value / per_file,
            lane,
        }
    }

    /// Lanes per container.
    pub fn lanes_per_file(&self) -> u32 {
        self.lanes_per_file
    }
}
