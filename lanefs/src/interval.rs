//! Closed integer intervals and sorted disjoint interval sets.
//!
//! Series track which positions hold real data with a set of [`Interval`]s
//! and who wrote each position with a set of [`TaggedInterval`]s. Both kinds
//! share the [`Span`] trait so [`IntervalSet`] and [`merge`] work on either.
//!
//! # Merge semantics
//!
//! When two intervals overlap the later one wins. Untagged intervals that
//! touch or overlap always coalesce; tagged intervals only coalesce when
//! their tags are equal.
//!
//! ```rust
//! use lanefs::interval::{merge, TaggedInterval};
//!
//! let a = TaggedInterval::new(0, 10, 1);
//! let b = TaggedInterval::new(5, 5, 2);
//! let merged = merge(&a, &b);
//! assert_eq!(
//!     merged,
//!     vec![
//!         TaggedInterval::new(0, 4, 1),
//!         TaggedInterval::new(5, 5, 2),
//!         TaggedInterval::new(6, 10, 1),
//!     ]
//! );
//! ```

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};

/// Common behaviour of closed `[start, end]` ranges.
pub trait Span: Clone + std::fmt::Debug + PartialEq {
    /// `true` if the binary form carries a tag.
    const TAGGED: bool;

    /// First covered position.
    fn start(&self) -> i64;

    /// Last covered position (inclusive).
    fn end(&self) -> i64;

    /// Originator tag, `0` for untagged intervals.
    fn tag(&self) -> u64;

    /// Copy of `self` covering `[start, end]` with the same tag.
    fn with_range(&self, start: i64, end: i64) -> Self;

    /// Builds an interval from raw parts. Untagged kinds ignore `tag`.
    fn from_parts(start: i64, end: i64, tag: u64) -> Self;

    /// `true` if two touching intervals may coalesce into one.
    fn same_kind(&self, other: &Self) -> bool {
        self.tag() == other.tag()
    }

    /// Number of positions covered.
    fn len(&self) -> u64 {
        #[allow(clippy::cast_sign_loss)] // start <= end is an invariant
        let n = (self.end() - self.start()) as u64 + 1;
        n
    }

    /// `true` if `position` lies inside the interval.
    fn contains(&self, position: i64) -> bool {
        position >= self.start() && position <= self.end()
    }

    /// `true` if the two ranges share at least one position.
    fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start() <= end && self.end() >= start
    }
}

/// A closed range of positions with no provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    /// First position.
    pub start: i64,
    /// Last position, inclusive.
    pub end: i64,
}

impl Interval {
    /// Creates `[start, end]`.
    ///
    /// # Panics
    ///
    /// Panics if `start > end`.
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start <= end, "interval start {start} exceeds end {end}");
        Self { start, end }
    }
}

impl Span for Interval {
    const TAGGED: bool = false;

    fn start(&self) -> i64 {
        self.start
    }

    fn end(&self) -> i64 {
        self.end
    }

    fn tag(&self) -> u64 {
        0
    }

    fn with_range(&self, start: i64, end: i64) -> Self {
        Self { start, end }
    }

    fn from_parts(start: i64, end: i64, _tag: u64) -> Self {
        Self { start, end }
    }

    fn same_kind(&self, _other: &Self) -> bool {
        true
    }
}

impl PartialOrd for Interval {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Interval {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.start, self.end).cmp(&(other.start, other.end))
    }
}

/// A closed range of positions written by one originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaggedInterval {
    /// First position.
    pub start: i64,
    /// Last position, inclusive.
    pub end: i64,
    /// Opaque originator id.
    pub tag: u64,
}

impl TaggedInterval {
    /// Creates `[start, end]` tagged with `tag`.
    ///
    /// # Panics
    ///
    /// Panics if `start > end`.
    pub fn new(start: i64, end: i64, tag: u64) -> Self {
        assert!(start <= end, "interval start {start} exceeds end {end}");
        Self { start, end, tag }
    }

    /// The untagged range.
    pub fn range(&self) -> Interval {
        Interval {
            start: self.start,
            end: self.end,
        }
    }
}

impl Span for TaggedInterval {
    const TAGGED: bool = true;

    fn start(&self) -> i64 {
        self.start
    }

    fn end(&self) -> i64 {
        self.end
    }

    fn tag(&self) -> u64 {
        self.tag
    }

    fn with_range(&self, start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            tag: self.tag,
        }
    }

    fn from_parts(start: i64, end: i64, tag: u64) -> Self {
        Self { start, end, tag }
    }
}

/// Merges `b` over `a`.
///
/// The output covers exactly the union of both ranges in ascending order.
/// Positions covered by both take `b`'s tag and adjacent pieces of the same
/// kind are coalesced.
pub fn merge<I: Span>(a: &I, b: &I) -> Vec<I> {
    let mut pieces = Vec::with_capacity(3);
    if a.start() < b.start() {
        pieces.push(a.with_range(a.start(), a.end().min(b.start() - 1)));
    }
    pieces.push(b.clone());
    if a.end() > b.end() {
        pieces.push(a.with_range(a.start().max(b.end() + 1), a.end()));
    }
    coalesce(pieces)
}

/// Joins neighbours that touch and are of the same kind. Input must be
/// sorted and disjoint.
fn coalesce<I: Span>(pieces: Vec<I>) -> Vec<I> {
    let mut out: Vec<I> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        match out.last_mut() {
            Some(prev) if prev.end() + 1 >= piece.start() && prev.same_kind(&piece) => {
                let end = prev.end().max(piece.end());
                *prev = prev.with_range(prev.start(), end);
            }
            _ => out.push(piece),
        }
    }
    out
}

/// A sorted set of disjoint intervals.
///
/// Every mutation keeps the set sorted by start with no overlaps, and no two
/// touching neighbours of the same kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalSet<I> {
    intervals: Vec<I>,
}

impl<I> Default for IntervalSet<I> {
    fn default() -> Self {
        Self {
            intervals: Vec::new(),
        }
    }
}

impl<I: Span> IntervalSet<I> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set by merging every interval in order, later ones winning.
    pub fn from_intervals(intervals: impl IntoIterator<Item = I>) -> Self {
        let mut set = Self::new();
        for interval in intervals {
            set.merge_interval(interval);
        }
        set
    }

    /// The intervals, sorted by start.
    pub fn as_slice(&self) -> &[I] {
        &self.intervals
    }

    /// Iterates in start order.
    pub fn iter(&self) -> std::slice::Iter<'_, I> {
        self.intervals.iter()
    }

    /// Consumes the set, returning its intervals.
    pub fn into_vec(self) -> Vec<I> {
        self.intervals
    }

    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// `true` if no positions are covered.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Total number of positions covered.
    pub fn covered(&self) -> u64 {
        self.intervals.iter().map(Span::len).sum()
    }

    /// First covered position.
    pub fn first_start(&self) -> Option<i64> {
        self.intervals.first().map(Span::start)
    }

    /// Last covered position.
    pub fn last_end(&self) -> Option<i64> {
        self.intervals.last().map(Span::end)
    }

    /// The interval holding `position`, if any.
    pub fn find(&self, position: i64) -> Option<&I> {
        let idx = self.intervals.partition_point(|i| i.end() < position);
        self.intervals.get(idx).filter(|i| i.contains(position))
    }

    /// `true` if `position` is covered.
    pub fn contains(&self, position: i64) -> bool {
        self.find(position).is_some()
    }

    /// `true` if any position in `[start, end]` is covered.
    pub fn any_in(&self, start: i64, end: i64) -> bool {
        if start > end {
            return false;
        }
        let idx = self.intervals.partition_point(|i| i.end() < start);
        self.intervals
            .get(idx)
            .is_some_and(|i| i.start() <= end)
    }

    /// Index range of intervals that overlap or touch `[start, end]`.
    fn touching(&self, start: i64, end: i64) -> (usize, usize) {
        let lo = self.intervals.partition_point(|i| i.end() < start - 1);
        let hi = self.intervals.partition_point(|i| i.start() <= end + 1);
        (lo, hi.max(lo))
    }

    /// Merges one interval into the set. It wins over anything it overlaps.
    pub fn merge_interval(&mut self, interval: I) {
        let (lo, hi) = self.touching(interval.start(), interval.end());
        let mut pieces = Vec::with_capacity(3);
        for existing in &self.intervals[lo..hi] {
            if existing.start() < interval.start() {
                pieces.push(existing.with_range(
                    existing.start(),
                    existing.end().min(interval.start() - 1),
                ));
            }
        }
        let mut trailing = Vec::new();
        for existing in &self.intervals[lo..hi] {
            if existing.end() > interval.end() {
                trailing.push(existing.with_range(
                    existing.start().max(interval.end() + 1),
                    existing.end(),
                ));
            }
        }
        pieces.push(interval);
        pieces.extend(trailing);
        self.intervals.splice(lo..hi, coalesce(pieces));
    }

    /// Merges every interval of `other`, which wins on overlap.
    pub fn merge_set(&mut self, other: &IntervalSet<I>) {
        for interval in &other.intervals {
            self.merge_interval(interval.clone());
        }
    }

    /// Removes every position in `[start, end]`, splitting intervals that
    /// straddle the boundary.
    pub fn delete_interval(&mut self, start: i64, end: i64) {
        if start > end {
            return;
        }
        let lo = self.intervals.partition_point(|i| i.end() < start);
        let hi = self.intervals.partition_point(|i| i.start() <= end).max(lo);
        let mut kept = Vec::with_capacity(2);
        for existing in &self.intervals[lo..hi] {
            if existing.start() < start {
                kept.push(existing.with_range(existing.start(), start - 1));
            }
            if existing.end() > end {
                kept.push(existing.with_range(end + 1, existing.end()));
            }
        }
        self.intervals.splice(lo..hi, kept);
    }

    /// Intervals overlapping `[start, end]`, optionally clipped to it.
    pub fn spanned_intervals(&self, start: i64, end: i64, clip: bool) -> Vec<I> {
        if start > end {
            return Vec::new();
        }
        let lo = self.intervals.partition_point(|i| i.end() < start);
        self.intervals[lo..]
            .iter()
            .take_while(|i| i.start() <= end)
            .map(|i| {
                if clip {
                    i.with_range(i.start().max(start), i.end().min(end))
                } else {
                    i.clone()
                }
            })
            .collect()
    }

    /// Writes the compact binary form: a `u32` count, then for each interval
    /// the start as a delta from the previous end, the length minus one, and
    /// the tag for tagged kinds. All little-endian.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Stream`] if the writer fails.
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let count = u32::try_from(self.intervals.len()).map_err(|_| CodecError::Frame {
            reason: format!("interval set too large: {}", self.intervals.len()),
        })?;
        out.write_all(&count.to_le_bytes()).map_err(CodecError::Stream)?;
        let mut prev_end = 0i64;
        for interval in &self.intervals {
            let delta = interval.start().checked_sub(prev_end).ok_or_else(|| CodecError::Frame {
                reason: format!("interval at {} too far from previous end {prev_end}", interval.start()),
            })?;
            out.write_all(&delta.to_le_bytes()).map_err(CodecError::Stream)?;
            out.write_all(&(interval.len() - 1).to_le_bytes())
                .map_err(CodecError::Stream)?;
            if I::TAGGED {
                out.write_all(&interval.tag().to_le_bytes())
                    .map_err(CodecError::Stream)?;
            }
            prev_end = interval.end();
        }
        Ok(())
    }

    /// Reads the form written by [`IntervalSet::write_to`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on a short read or if the decoded intervals are
    /// not sorted and disjoint.
    pub fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let count = read_u32(input)?;
        let mut intervals: Vec<I> = Vec::with_capacity(count.min(4096) as usize);
        let mut prev_end = 0i64;
        for _ in 0..count {
            let overflow = || CodecError::Frame {
                reason: format!("interval after {prev_end} overflows the position range"),
            };
            let start = prev_end.checked_add(read_i64(input)?).ok_or_else(overflow)?;
            let span = i64::try_from(read_u64(input)?).map_err(|_| overflow())?;
            let tag = if I::TAGGED { read_u64(input)? } else { 0 };
            let end = start.checked_add(span).ok_or_else(overflow)?;
            if let Some(prev) = intervals.last()
                && prev.end() >= start
            {
                return Err(CodecError::Frame {
                    reason: format!("interval at {start} overlaps previous ending {}", prev.end()),
                }
                .into());
            }
            intervals.push(I::from_parts(start, end, tag));
            prev_end = end;
        }
        Ok(Self { intervals })
    }
}

impl<I: Span> FromIterator<I> for IntervalSet<I> {
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        Self::from_intervals(iter)
    }
}

impl<'a, I> IntoIterator for &'a IntervalSet<I> {
    type Item = &'a I;
    type IntoIter = std::slice::Iter<'a, I>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.iter()
    }
}

pub(crate) fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf).map_err(CodecError::Stream)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64<R: Read>(input: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf).map_err(CodecError::Stream)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_i64<R: Read>(input: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf).map_err(CodecError::Stream)?;
    Ok(i64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(start: i64, end: i64, tag: u64) -> TaggedInterval {
        TaggedInterval::new(start, end, tag)
    }

    #[test]
    fn test_merge_identical_ranges_b_wins() {
        assert_eq!(merge(&t(0, 9, 1), &t(0, 9, 2)), vec![t(0, 9, 2)]);
    }

    #[test]
    fn test_merge_point_inside_splits_three_ways() {
        assert_eq!(
            merge(&t(0, 9, 1), &t(4, 4, 2)),
            vec![t(0, 3, 1), t(4, 4, 2), t(5, 9, 1)]
        );
    }

    #[test]
    fn test_merge_point_with_same_tag_collapses() {
        assert_eq!(merge(&t(0, 9, 1), &t(4, 4, 1)), vec![t(0, 9, 1)]);
    }

    #[test]
    fn test_merge_disjoint_keeps_both_in_order() {
        assert_eq!(merge(&t(10, 12, 1), &t(0, 2, 2)), vec![t(0, 2, 2), t(10, 12, 1)]);
        assert_eq!(merge(&t(0, 2, 1), &t(10, 12, 1)), vec![t(0, 2, 1), t(10, 12, 1)]);
    }

    #[test]
    fn test_merge_touching_untagged_coalesce() {
        let merged = merge(&Interval::new(0, 4), &Interval::new(5, 8));
        assert_eq!(merged, vec![Interval::new(0, 8)]);
    }

    #[test]
    fn test_merge_partial_overlap() {
        assert_eq!(merge(&t(0, 5, 1), &t(3, 8, 2)), vec![t(0, 2, 1), t(3, 8, 2)]);
        assert_eq!(merge(&t(3, 8, 1), &t(0, 5, 2)), vec![t(0, 5, 2), t(6, 8, 1)]);
    }

    #[test]
    fn test_set_merge_spanning_many() {
        let mut set = IntervalSet::from_intervals([t(0, 2, 1), t(4, 6, 2), t(8, 10, 3)]);
        set.merge_interval(t(1, 9, 7));
        assert_eq!(set.as_slice(), &[t(0, 0, 1), t(1, 9, 7), t(10, 10, 3)]);
    }

    #[test]
    fn test_set_merge_untagged_bridges_gap() {
        let mut set = IntervalSet::from_intervals([Interval::new(0, 4), Interval::new(8, 10)]);
        set.merge_interval(Interval::new(5, 7));
        assert_eq!(set.as_slice(), &[Interval::new(0, 10)]);
        assert_eq!(set.covered(), 11);
    }

    #[test]
    fn test_delete_interval_splits() {
        let mut set = IntervalSet::from_intervals([Interval::new(0, 10), Interval::new(20, 30)]);
        set.delete_interval(5, 22);
        assert_eq!(set.as_slice(), &[Interval::new(0, 4), Interval::new(23, 30)]);
        set.delete_interval(-100, 100);
        assert!(set.is_empty());
    }

    #[test]
    fn test_spanned_intervals_clip() {
        let set = IntervalSet::from_intervals([t(0, 10, 1), t(20, 30, 2), t(40, 50, 3)]);
        assert_eq!(set.spanned_intervals(5, 25, false), vec![t(0, 10, 1), t(20, 30, 2)]);
        assert_eq!(set.spanned_intervals(5, 25, true), vec![t(5, 10, 1), t(20, 25, 2)]);
        assert!(set.spanned_intervals(11, 19, true).is_empty());
    }

    #[test]
    fn test_contains_and_any_in() {
        let set = IntervalSet::from_intervals([Interval::new(0, 4), Interval::new(8, 10)]);
        assert!(set.contains(4));
        assert!(!set.contains(5));
        assert!(set.any_in(5, 8));
        assert!(!set.any_in(5, 7));
        assert_eq!(set.find(9), Some(&Interval::new(8, 10)));
    }

    #[test]
    fn test_binary_form() {
        let set = IntervalSet::from_intervals([t(-1, 3, 9), t(10, 10, 4), t(12, 40, 9)]);
        let mut buf = Vec::new();
        set.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 4 + 3 * 24);
        let back = IntervalSet::<TaggedInterval>::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_binary_truncated_is_error() {
        let set = IntervalSet::from_intervals([Interval::new(0, 3)]);
        let mut buf = Vec::new();
        set.write_to(&mut buf).unwrap();
        buf.pop();
        assert!(IntervalSet::<Interval>::read_from(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn test_binary_overflowing_positions_are_errors() {
        // One interval starting at i64::MAX and spanning two positions.
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&i64::MAX.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        let err = IntervalSet::<Interval>::read_from(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, crate::FsError::Codec(CodecError::Frame { .. })));

        // A second start delta pushing past i64::MAX.
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&10i64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&i64::MAX.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        let err = IntervalSet::<Interval>::read_from(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, crate::FsError::Codec(CodecError::Frame { .. })));
    }
}
