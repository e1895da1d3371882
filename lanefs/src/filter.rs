//! Restricting interval lists to a selected subset of positions.
//!
//! Callers sometimes ask for a sparse set of positions (only some cadences
//! out of a range). [`IntervalFilter`] clips interval lists to those
//! positions and re-bases them into the compacted coordinate system where the
//! selected positions are numbered `offset, offset + 1, ...`.

use crate::interval::Span;

/// Clips and re-bases intervals against a boolean selection mask.
#[derive(Debug, Clone)]
pub struct IntervalFilter {
    /// Position that mask index 0 corresponds to.
    origin: i64,
    /// `rank[i]` is the number of selected positions before mask index `i`.
    rank: Vec<i64>,
    mask: Vec<bool>,
    offset: i64,
}

impl IntervalFilter {
    /// Creates a filter whose mask index 0 is position `origin`. Filtered
    /// output starts at zero.
    pub fn new(mask: &[bool], origin: i64) -> Self {
        Self::with_offset(mask, origin, 0)
    }

    /// Like [`IntervalFilter::new`] but output positions start at `offset`.
    pub fn with_offset(mask: &[bool], origin: i64, offset: i64) -> Self {
        let mut rank = Vec::with_capacity(mask.len());
        let mut selected = 0i64;
        for &bit in mask {
            rank.push(selected);
            if bit {
                selected += 1;
            }
        }
        Self {
            origin,
            rank,
            mask: mask.to_vec(),
            offset,
        }
    }

    /// Number of selected positions.
    pub fn selected(&self) -> usize {
        self.mask.iter().filter(|b| **b).count()
    }

    fn index_of(&self, position: i64) -> Option<usize> {
        usize::try_from(position - self.origin)
            .ok()
            .filter(|i| *i < self.mask.len())
    }

    /// Filters `intervals`, keeping their order and tags.
    ///
    /// Each input interval contributes at most one output interval spanning
    /// its first to last selected position, re-based into compacted
    /// coordinates. Intervals with no selected position are dropped.
    pub fn apply<I: Span>(&self, intervals: &[I]) -> Vec<I> {
        let mut out = Vec::with_capacity(intervals.len());
        for interval in intervals {
            let lo = interval.start().max(self.origin);
            let hi = interval
                .end()
                .min(self.origin + self.mask.len() as i64 - 1);
            if lo > hi {
                continue;
            }
            let first = (lo..=hi).find_map(|p| self.index_of(p).filter(|i| self.mask[*i]));
            let last = (lo..=hi)
                .rev()
                .find_map(|p| self.index_of(p).filter(|i| self.mask[*i]));
            if let (Some(first), Some(last)) = (first, last) {
                out.push(interval.with_range(
                    self.rank[first] + self.offset,
                    self.rank[last] + self.offset,
                ));
            }
        }
        out
    }
}
