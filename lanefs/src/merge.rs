//! Splitting a time-series write into physical write chunks.
//!
//! New data arrives as one dense buffer covering `[first, last]` plus the
//! valid and originator intervals inside it. Positions between new valid
//! intervals are gaps in the buffer. Writing the buffer straight over the
//! series would clobber whatever existing data sits under those gaps, so
//! the write is cut into chunks: a chunk may span a gap only if nothing
//! existing lives there. Chunks are also capped at [`BREAK_AT`] positions to
//! bound the write buffer.
//!
//! ```rust
//! use lanefs::interval::{Interval, IntervalSet, TaggedInterval};
//! use lanefs::merge::MergePlan;
//!
//! let existing = IntervalSet::from_intervals([Interval::new(0, 10)]);
//! let new_valid = vec![Interval::new(4, 4), Interval::new(6, 6)];
//! let new_orig = vec![TaggedInterval::new(4, 4, 1), TaggedInterval::new(6, 6, 1)];
//!
//! let plan = MergePlan::new(new_valid, new_orig, existing);
//! assert_eq!(plan.chunks().count(), 2);
//! ```

use std::iter::FusedIterator;

use crate::error::{Result, StorageError};
use crate::interval::{Interval, IntervalSet, TaggedInterval};

/// Maximum positions one chunk may span.
pub const BREAK_AT: i64 = 65536;

/// One physical write: a contiguous slice of the new buffer and the
/// metadata it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteChunk {
    /// New valid intervals written by this chunk, sorted.
    pub valid: Vec<Interval>,
    /// Originator intervals for exactly the positions in `valid`.
    pub originators: Vec<TaggedInterval>,
}

impl WriteChunk {
    /// First position written.
    pub fn start(&self) -> i64 {
        self.valid.first().map_or(0, |i| i.start)
    }

    /// Last position written.
    pub fn end(&self) -> i64 {
        self.valid.last().map_or(-1, |i| i.end)
    }
}

/// Inputs of a merge. Each call to [`MergePlan::chunks`] starts a fresh
/// pass, so a plan can be replayed after a failed write.
#[derive(Debug, Clone)]
pub struct MergePlan {
    new_valid: Vec<Interval>,
    new_originators: IntervalSet<TaggedInterval>,
    existing: IntervalSet<Interval>,
    break_at: i64,
}

impl MergePlan {
    /// Plans a merge of new data over `existing`.
    pub fn new(
        new_valid: Vec<Interval>,
        new_originators: Vec<TaggedInterval>,
        existing: IntervalSet<Interval>,
    ) -> Self {
        Self {
            new_valid: IntervalSet::from_intervals(new_valid).into_vec(),
            new_originators: IntervalSet::from_intervals(new_originators),
            existing,
            break_at: BREAK_AT,
        }
    }

    /// Plans an overwrite. The caller deletes the target range first, so
    /// nothing existing constrains the chunks and only [`BREAK_AT`] splits.
    pub fn overwrite(new_valid: Vec<Interval>, new_originators: Vec<TaggedInterval>) -> Self {
        Self::new(new_valid, new_originators, IntervalSet::new())
    }

    /// Overrides the chunk size cap.
    ///
    /// # Panics
    ///
    /// Panics if `break_at` is not positive.
    #[must_use]
    pub fn with_break_at(mut self, break_at: i64) -> Self {
        assert!(break_at > 0, "break_at must be positive");
        self.break_at = break_at;
        self
    }

    /// A lazy pass over the chunks.
    pub fn chunks(&self) -> TimeSeriesMergeIterator<'_> {
        TimeSeriesMergeIterator {
            plan: self,
            index: 0,
            resume_at: None,
        }
    }
}

/// Lazily yields the [`WriteChunk`]s of a [`MergePlan`].
#[derive(Debug, Clone)]
pub struct TimeSeriesMergeIterator<'a> {
    plan: &'a MergePlan,
    /// Next new valid interval to consume.
    index: usize,
    /// Set when the interval at `index` was split at a size cap.
    resume_at: Option<i64>,
}

impl TimeSeriesMergeIterator<'_> {
    /// `true` if another chunk remains.
    pub fn has_next(&self) -> bool {
        self.index < self.plan.new_valid.len()
    }

    /// Like [`Iterator::next`] but treats overrun as an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NoMoreChunks`] once the pass is exhausted.
    pub fn next_chunk(&mut self) -> Result<WriteChunk> {
        self.next().ok_or_else(|| StorageError::NoMoreChunks.into())
    }

    fn originators_for(&self, valid: &[Interval]) -> Vec<TaggedInterval> {
        valid
            .iter()
            .flat_map(|v| self.plan.new_originators.spanned_intervals(v.start, v.end, true))
            .collect()
    }
}

impl Iterator for TimeSeriesMergeIterator<'_> {
    type Item = WriteChunk;

    fn next(&mut self) -> Option<WriteChunk> {
        let intervals = &self.plan.new_valid;
        let first = intervals.get(self.index)?;
        let chunk_start = self.resume_at.take().unwrap_or(first.start);
        let limit = chunk_start.saturating_add(self.plan.break_at - 1);

        let mut valid = Vec::new();
        let mut current = Interval::new(chunk_start, first.end);
        loop {
            if current.end > limit {
                valid.push(Interval::new(current.start, limit));
                self.resume_at = Some(limit + 1);
                break;
            }
            valid.push(current);
            self.index += 1;

            let Some(next) = intervals.get(self.index) else {
                break;
            };
            let gap_hides_existing = self.plan.existing.any_in(current.end + 1, next.start - 1);
            if gap_hides_existing || next.start > limit {
                break;
            }
            current = *next;
        }

        let originators = self.originators_for(&valid);
        Some(WriteChunk { valid, originators })
    }
}

impl FusedIterator for TimeSeriesMergeIterator<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(ps: &[i64]) -> (Vec<Interval>, Vec<TaggedInterval>) {
        (
            ps.iter().map(|p| Interval::new(*p, *p)).collect(),
            ps.iter().map(|p| TaggedInterval::new(*p, *p, 1)).collect(),
        )
    }

    #[test]
    fn test_untouched_existing_is_not_rewritten() {
        let existing = IntervalSet::from_intervals([Interval::new(0, 4), Interval::new(8, 10)]);
        let (valid, orig) = points(&[4, 6, 8]);
        let plan = MergePlan::new(valid.clone(), orig.clone(), existing);
        let chunks: Vec<WriteChunk> = plan.chunks().collect();
        assert_eq!(chunks, vec![WriteChunk { valid, originators: orig }]);
    }

    #[test]
    fn test_existing_under_gaps_forces_breaks() {
        let existing = IntervalSet::from_intervals([
            Interval::new(0, 4),
            Interval::new(5, 7),
            Interval::new(7, 10),
        ]);
        let (valid, orig) = points(&[4, 6, 8]);
        let plan = MergePlan::new(valid, orig, existing);
        let chunks: Vec<WriteChunk> = plan.chunks().collect();
        assert_eq!(chunks.len(), 3);
        for (chunk, p) in chunks.iter().zip([4, 6, 8]) {
            assert_eq!(chunk.valid, vec![Interval::new(p, p)]);
            assert_eq!(chunk.originators, vec![TaggedInterval::new(p, p, 1)]);
        }
    }

    #[test]
    fn test_disjoint_new_data_still_emitted() {
        let existing = IntervalSet::from_intervals([Interval::new(100, 200)]);
        let plan = MergePlan::new(
            vec![Interval::new(0, 9)],
            vec![TaggedInterval::new(0, 9, 5)],
            existing,
        );
        let chunks: Vec<WriteChunk> = plan.chunks().collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].start(), chunks[0].end()), (0, 9));
    }

    #[test]
    fn test_break_at_splits_long_runs() {
        let plan = MergePlan::overwrite(
            vec![Interval::new(0, 24)],
            vec![TaggedInterval::new(0, 9, 1), TaggedInterval::new(10, 24, 2)],
        )
        .with_break_at(10);
        let chunks: Vec<WriteChunk> = plan.chunks().collect();
        let spans: Vec<(i64, i64)> = chunks.iter().map(|c| (c.start(), c.end())).collect();
        assert_eq!(spans, vec![(0, 9), (10, 19), (20, 24)]);
        assert_eq!(chunks[1].originators, vec![TaggedInterval::new(10, 19, 2)]);
    }

    #[test]
    fn test_break_at_stops_accumulation() {
        let plan = MergePlan::overwrite(
            vec![Interval::new(0, 3), Interval::new(6, 8), Interval::new(12, 13)],
            vec![TaggedInterval::new(0, 13, 1)],
        )
        .with_break_at(10);
        let spans: Vec<(i64, i64)> = plan.chunks().map(|c| (c.start(), c.end())).collect();
        assert_eq!(spans, vec![(0, 8), (12, 13)]);
    }

    #[test]
    fn test_restartable_and_overrun() {
        let (valid, orig) = points(&[1, 2]);
        let plan = MergePlan::overwrite(valid, orig);
        assert_eq!(plan.chunks().count(), 1);

        let mut pass = plan.chunks();
        assert!(pass.has_next());
        pass.next_chunk().unwrap();
        assert!(!pass.has_next());
        let err = pass.next_chunk().unwrap_err();
        assert!(matches!(err, crate::FsError::Storage(StorageError::NoMoreChunks)));
        assert!(pass.next().is_none());

        assert_eq!(plan.chunks().count(), 1);
    }

    #[test]
    fn test_early_stop_is_cheap() {
        let valid: Vec<Interval> = (0..1000).map(|i| Interval::new(i * 3, i * 3)).collect();
        let orig: Vec<TaggedInterval> = valid.iter().map(|v| TaggedInterval::new(v.start, v.end, 1)).collect();
        let existing = IntervalSet::from_intervals([Interval::new(0, 3000)]);
        let plan = MergePlan::new(valid, orig, existing);
        let first_two: Vec<WriteChunk> = plan.chunks().take(2).collect();
        assert_eq!(first_two[1].valid, vec![Interval::new(3, 3)]);
    }
}
