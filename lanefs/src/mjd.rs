//! Series sampled at irregular times.
//!
//! An [`MjdTimeSeries`] holds single precision values keyed by Modified
//! Julian Date instead of by cadence position, for events that do not fall
//! on the cadence grid. A committed series is stored whole, placed like a
//! blob; a transaction stages the complete point set it will commit.
//!
//! # Stored format
//!
//! ```text
//! [0..4)   magic "LNMJ"
//! [4..12)  point count (u64 LE)
//! points   time f64 LE | value f32 LE | originator u64 LE
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::{CodecError, Result, StorageError};
use crate::id::FsId;

const POINTS_MAGIC: [u8; 4] = *b"LNMJ";
const POINTS_HEADER: usize = 12;
const POINT_LEN: usize = 20;

/// Values at increasing times over `[start_mjd, end_mjd]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MjdTimeSeries {
    id: FsId,
    start_mjd: f64,
    end_mjd: f64,
    mjd: Vec<f64>,
    values: Vec<f32>,
    originators: Vec<u64>,
    exists: bool,
}

fn invalid(id: &FsId, reason: impl Into<String>) -> crate::FsError {
    StorageError::InvalidSeries {
        id: id.to_string(),
        reason: reason.into(),
    }
    .into()
}

impl MjdTimeSeries {
    /// Builds a series covering `[start_mjd, end_mjd]`. Writing it with
    /// overwrite replaces every stored point in that range, so an empty
    /// series erases the range.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidSeries`] if the range is reversed or
    /// not a number, the three columns differ in length, or the times are
    /// not strictly increasing inside the range.
    pub fn new(
        id: FsId,
        start_mjd: f64,
        end_mjd: f64,
        mjd: Vec<f64>,
        values: Vec<f32>,
        originators: Vec<u64>,
    ) -> Result<Self> {
        if start_mjd.is_nan() || end_mjd.is_nan() || end_mjd < start_mjd {
            return Err(invalid(&id, format!("bad time range [{start_mjd}, {end_mjd}]")));
        }
        if mjd.len() != values.len() || mjd.len() != originators.len() {
            return Err(invalid(
                &id,
                format!(
                    "{} times, {} values and {} originators",
                    mjd.len(),
                    values.len(),
                    originators.len()
                ),
            ));
        }
        if let Some(bad) = mjd.iter().find(|t| !(start_mjd..=end_mjd).contains(*t)) {
            return Err(invalid(&id, format!("time {bad} outside [{start_mjd}, {end_mjd}]")));
        }
        if let Some(pair) = mjd.windows(2).find(|w| w[0] >= w[1]) {
            return Err(invalid(&id, format!("times {} and {} out of order", pair[0], pair[1])));
        }
        Ok(Self {
            id,
            start_mjd,
            end_mjd,
            mjd,
            values,
            originators,
            exists: true,
        })
    }

    /// The sentinel returned for ids with no stored points.
    pub fn non_existent(id: FsId, start_mjd: f64, end_mjd: f64) -> Self {
        Self {
            id,
            start_mjd,
            end_mjd,
            mjd: Vec::new(),
            values: Vec::new(),
            originators: Vec::new(),
            exists: false,
        }
    }

    /// The series id.
    pub fn id(&self) -> &FsId {
        &self.id
    }

    /// First time of the covered range.
    pub fn start_mjd(&self) -> f64 {
        self.start_mjd
    }

    /// Last time of the covered range.
    pub fn end_mjd(&self) -> f64 {
        self.end_mjd
    }

    /// Sample times, strictly increasing.
    pub fn mjd(&self) -> &[f64] {
        &self.mjd
    }

    /// Sample values, one per time.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Originator of each sample.
    pub fn originators(&self) -> &[u64] {
        &self.originators
    }

    /// `false` for the sentinel of a missing id.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.mjd.len()
    }

    /// `true` if there are no samples.
    pub fn is_empty(&self) -> bool {
        self.mjd.is_empty()
    }
}

/// A time ordered by [`f64::total_cmp`]. Times are never NaN.
#[derive(Debug, Clone, Copy)]
struct MjdKey(f64);

impl PartialEq for MjdKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MjdKey {}

impl PartialOrd for MjdKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MjdKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Every stored point of one series.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct MjdPoints {
    points: BTreeMap<MjdKey, (f32, u64)>,
}

impl MjdPoints {
    /// Merges `series`, its points replacing any at the same times. With
    /// `overwrite`, every point in the series' range is erased first.
    pub fn write(&mut self, series: &MjdTimeSeries, overwrite: bool) {
        if overwrite {
            let doomed: Vec<MjdKey> = self
                .points
                .range(MjdKey(series.start_mjd)..=MjdKey(series.end_mjd))
                .map(|(time, _)| *time)
                .collect();
            for time in doomed {
                self.points.remove(&time);
            }
        }
        for ((time, value), originator) in series.mjd.iter().zip(&series.values).zip(&series.originators) {
            self.points.insert(MjdKey(*time), (*value, *originator));
        }
    }

    /// The points in `[start, end]`, which must be ordered.
    pub fn read(&self, id: &FsId, start: f64, end: f64) -> MjdTimeSeries {
        let mut series = MjdTimeSeries::non_existent(id.clone(), start, end);
        series.exists = true;
        for (time, (value, originator)) in self.points.range(MjdKey(start)..=MjdKey(end)) {
            series.mjd.push(time.0);
            series.values.push(*value);
            series.originators.push(*originator);
        }
        series
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(POINTS_HEADER + self.points.len() * POINT_LEN);
        out.extend_from_slice(&POINTS_MAGIC);
        out.extend_from_slice(&(self.points.len() as u64).to_le_bytes());
        for (time, (value, originator)) in &self.points {
            out.extend_from_slice(&time.0.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
            out.extend_from_slice(&originator.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let frame = |reason: String| -> crate::FsError { CodecError::Frame { reason }.into() };
        let (header, body) = bytes
            .split_first_chunk::<POINTS_HEADER>()
            .ok_or_else(|| frame(format!("point set of {} bytes has no header", bytes.len())))?;
        if header[..4] != POINTS_MAGIC {
            return Err(frame("bad point set magic".to_string()));
        }
        let mut count = [0u8; 8];
        count.copy_from_slice(&header[4..]);
        let count = u64::from_le_bytes(count);
        if usize::try_from(count).ok().and_then(|n| n.checked_mul(POINT_LEN)) != Some(body.len()) {
            return Err(frame(format!("{count} points in {} bytes", body.len())));
        }
        let mut points = BTreeMap::new();
        let mut previous: Option<f64> = None;
        for chunk in body.chunks_exact(POINT_LEN) {
            let mut time = [0u8; 8];
            let mut value = [0u8; 4];
            let mut originator = [0u8; 8];
            time.copy_from_slice(&chunk[..8]);
            value.copy_from_slice(&chunk[8..12]);
            originator.copy_from_slice(&chunk[12..]);
            let time = f64::from_le_bytes(time);
            if time.is_nan() || previous.is_some_and(|p| p >= time) {
                return Err(frame(format!("point time {time} out of order")));
            }
            previous = Some(time);
            points.insert(MjdKey(time), (f32::from_le_bytes(value), u64::from_le_bytes(originator)));
        }
        Ok(Self { points })
    }
}

/// Rejects reversed or NaN read ranges.
pub(crate) fn validate_range(start: f64, end: f64) -> Result<()> {
    if start.is_nan() || end.is_nan() || end < start {
        return Err(StorageError::InvalidMjdRange { start, end }.into());
    }
    Ok(())
}
