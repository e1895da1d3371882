//! Time series values and their interchange formats.
//!
//! A [`TimeSeries`] is a dense buffer of values over the positions
//! `[start, end]`, plus the intervals saying which positions hold real data
//! (valid) and who wrote each of them (originators). Positions outside every
//! valid interval are gaps; their buffer slots hold a fill value.
//!
//! Two interchange formats are provided:
//!
//! - A pipe-delimited text form for verification and tooling, see
//!   [`TimeSeries::to_pipe_string`].
//! - A binary transfer form with an explicit payload length, see
//!   [`TimeSeries::transfer_to`]. [`SeriesCarrier`] forwards the binary form
//!   without decoding the values.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result, StorageError};
use crate::filter::IntervalFilter;
use crate::id::FsId;
use crate::interval::{read_i64, read_u64, Interval, IntervalSet, Span, TaggedInterval};

/// Element type of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 32-bit signed integers.
    Int,
    /// 32-bit floats.
    Float,
    /// 64-bit floats.
    Double,
}

impl DataType {
    /// Bytes per element.
    pub fn width(self) -> usize {
        match self {
            DataType::Int | DataType::Float => 4,
            DataType::Double => 8,
        }
    }

    /// Tag byte used in binary formats.
    pub fn code(self) -> u8 {
        match self {
            DataType::Int => 1,
            DataType::Float => 2,
            DataType::Double => 3,
        }
    }

    /// Inverse of [`DataType::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DataType::Int),
            2 => Some(DataType::Float),
            3 => Some(DataType::Double),
            _ => None,
        }
    }

    /// Name used in text formats.
    pub fn name(self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Double => "double",
        }
    }

    /// Inverse of [`DataType::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "int" => Some(DataType::Int),
            "float" => Some(DataType::Float),
            "double" => Some(DataType::Double),
            _ => None,
        }
    }
}

/// A typed value buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesData {
    /// Integer values.
    Int(Vec<i32>),
    /// Single precision values.
    Float(Vec<f32>),
    /// Double precision values.
    Double(Vec<f64>),
}

impl SeriesData {
    /// An empty buffer of type `data_type`.
    pub fn empty(data_type: DataType) -> Self {
        Self::filled(data_type, 0, 0.0)
    }

    /// `len` copies of `fill`, converted to `data_type`.
    #[allow(clippy::cast_possible_truncation)] // fill values are caller-chosen sentinels
    pub fn filled(data_type: DataType, len: usize, fill: f64) -> Self {
        match data_type {
            DataType::Int => SeriesData::Int(vec![fill as i32; len]),
            DataType::Float => SeriesData::Float(vec![fill as f32; len]),
            DataType::Double => SeriesData::Double(vec![fill; len]),
        }
    }

    /// Element type.
    pub fn data_type(&self) -> DataType {
        match self {
            SeriesData::Int(_) => DataType::Int,
            SeriesData::Float(_) => DataType::Float,
            SeriesData::Double(_) => DataType::Double,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            SeriesData::Int(v) => v.len(),
            SeriesData::Float(v) => v.len(),
            SeriesData::Double(v) => v.len(),
        }
    }

    /// `true` if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Little-endian bytes of elements `[from, to)`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn slice_bytes(&self, from: usize, to: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity((to - from) * self.data_type().width());
        match self {
            SeriesData::Int(v) => v[from..to].iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            SeriesData::Float(v) => v[from..to].iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            SeriesData::Double(v) => v[from..to].iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        }
        out
    }

    /// Copy of elements `[from, to)`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn slice(&self, from: usize, to: usize) -> Self {
        match self {
            SeriesData::Int(v) => SeriesData::Int(v[from..to].to_vec()),
            SeriesData::Float(v) => SeriesData::Float(v[from..to].to_vec()),
            SeriesData::Double(v) => SeriesData::Double(v[from..to].to_vec()),
        }
    }

    /// Little-endian bytes of every element.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.slice_bytes(0, self.len())
    }

    /// Decodes little-endian elements.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Frame`] if the length is not a multiple of the
    /// element width.
    pub fn from_le_bytes(data_type: DataType, bytes: &[u8]) -> Result<Self> {
        let width = data_type.width();
        if bytes.len() % width != 0 {
            return Err(CodecError::Frame {
                reason: format!("{} bytes is not a whole number of {} values", bytes.len(), data_type.name()),
            }
            .into());
        }
        let data = match data_type {
            DataType::Int => SeriesData::Int(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DataType::Float => SeriesData::Float(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DataType::Double => SeriesData::Double(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
        };
        Ok(data)
    }

    /// Copies elements of `other` over this buffer starting at `at`.
    ///
    /// # Panics
    ///
    /// Panics if the types differ or `other` does not fit.
    pub fn overlay(&mut self, at: usize, other: &SeriesData) {
        match (self, other) {
            (SeriesData::Int(dst), SeriesData::Int(src)) => dst[at..at + src.len()].copy_from_slice(src),
            (SeriesData::Float(dst), SeriesData::Float(src)) => dst[at..at + src.len()].copy_from_slice(src),
            (SeriesData::Double(dst), SeriesData::Double(src)) => dst[at..at + src.len()].copy_from_slice(src),
            (dst, src) => panic!(
                "overlaying {} values onto {} buffer",
                src.data_type().name(),
                dst.data_type().name()
            ),
        }
    }

    /// The elements whose `mask` entry is set, in order.
    pub fn select(&self, mask: &[bool]) -> Self {
        fn pick<T: Copy>(values: &[T], mask: &[bool]) -> Vec<T> {
            values
                .iter()
                .zip(mask)
                .filter_map(|(value, keep)| keep.then_some(*value))
                .collect()
        }
        match self {
            SeriesData::Int(v) => SeriesData::Int(pick(v, mask)),
            SeriesData::Float(v) => SeriesData::Float(pick(v, mask)),
            SeriesData::Double(v) => SeriesData::Double(pick(v, mask)),
        }
    }

    fn value_string(&self, i: usize) -> String {
        match self {
            SeriesData::Int(v) => v[i].to_string(),
            SeriesData::Float(v) => v[i].to_string(),
            SeriesData::Double(v) => v[i].to_string(),
        }
    }

    fn parse_values(data_type: DataType, fields: &[&str], first_field: usize) -> Result<Self> {
        fn parse<T: std::str::FromStr>(fields: &[&str], first_field: usize) -> Result<Vec<T>> {
            fields
                .iter()
                .enumerate()
                .map(|(i, f)| {
                    f.parse::<T>().map_err(|_| {
                        CodecError::PipeString {
                            field: first_field + i,
                            reason: format!("bad value '{f}'"),
                        }
                        .into()
                    })
                })
                .collect()
        }
        Ok(match data_type {
            DataType::Int => SeriesData::Int(parse(fields, first_field)?),
            DataType::Float => SeriesData::Float(parse(fields, first_field)?),
            DataType::Double => SeriesData::Double(parse(fields, first_field)?),
        })
    }

    /// The integer values, if this is an integer buffer.
    pub fn as_ints(&self) -> Option<&[i32]> {
        match self {
            SeriesData::Int(v) => Some(v),
            _ => None,
        }
    }

    /// The single precision values, if this is a float buffer.
    pub fn as_floats(&self) -> Option<&[f32]> {
        match self {
            SeriesData::Float(v) => Some(v),
            _ => None,
        }
    }

    /// The double precision values, if this is a double buffer.
    pub fn as_doubles(&self) -> Option<&[f64]> {
        match self {
            SeriesData::Double(v) => Some(v),
            _ => None,
        }
    }
}

/// A named series of values over `[start, end]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    id: FsId,
    start: i64,
    end: i64,
    data: SeriesData,
    valid: IntervalSet<Interval>,
    originators: IntervalSet<TaggedInterval>,
    exists: bool,
}

impl TimeSeries {
    /// Builds a series whose first value sits at position `start`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidSeries`] if `data` is empty, a valid
    /// interval falls outside the buffer, or the originators do not cover
    /// exactly the valid positions.
    pub fn new(
        id: FsId,
        start: i64,
        data: SeriesData,
        valid: Vec<Interval>,
        originators: Vec<TaggedInterval>,
    ) -> Result<Self> {
        if data.is_empty() {
            return Err(invalid(&id, "value buffer is empty"));
        }
        let end = last_position(&id, start, data.len())?;
        Self::checked(id, start, end, data, valid, originators, true)
    }

    /// Builds a series from per-position gap flags, every valid position
    /// attributed to `originator`. Positions past the end of `gaps` are
    /// valid.
    ///
    /// # Errors
    ///
    /// Same as [`TimeSeries::new`].
    pub fn from_gaps(id: FsId, start: i64, data: SeriesData, gaps: &[bool], originator: u64) -> Result<Self> {
        if data.is_empty() {
            return Err(invalid(&id, "value buffer is empty"));
        }
        let end = last_position(&id, start, data.len())?;
        let mut valid = Vec::new();
        let mut run_start = None;
        for offset in 0..data.len() {
            let gap = gaps.get(offset).copied().unwrap_or(false);
            let position = start + offset as i64;
            match (gap, run_start) {
                (false, None) => run_start = Some(position),
                (true, Some(s)) => {
                    valid.push(Interval::new(s, position - 1));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = run_start {
            valid.push(Interval::new(s, end));
        }
        let originators = valid
            .iter()
            .map(|v| TaggedInterval::new(v.start, v.end, originator))
            .collect();
        Self::new(id, start, data, valid, originators)
    }

    /// The sentinel returned for ids with no storage.
    pub fn non_existent(id: FsId, data_type: DataType) -> Self {
        Self {
            id,
            start: -1,
            end: -1,
            data: SeriesData::empty(data_type),
            valid: IntervalSet::new(),
            originators: IntervalSet::new(),
            exists: false,
        }
    }

    pub(crate) fn checked(
        id: FsId,
        start: i64,
        end: i64,
        data: SeriesData,
        valid: Vec<Interval>,
        originators: Vec<TaggedInterval>,
        exists: bool,
    ) -> Result<Self> {
        let expected = if end < start {
            0
        } else {
            end.checked_sub(start)
                .and_then(|span| span.checked_add(1))
                .and_then(|len| usize::try_from(len).ok())
                .ok_or_else(|| invalid(&id, format!("[{start}, {end}] is too long")))?
        };
        if data.len() != expected {
            return Err(invalid(
                &id,
                format!("[{start}, {end}] needs {expected} values, got {}", data.len()),
            ));
        }
        let valid = IntervalSet::from_intervals(valid);
        if let Some(bad) = valid.iter().find(|v| v.start < start || v.end > end) {
            return Err(invalid(&id, format!("valid interval {bad:?} outside [{start}, {end}]")));
        }
        let originators = IntervalSet::from_intervals(originators);
        let covered: IntervalSet<Interval> = originators.iter().map(TaggedInterval::range).collect();
        if covered != valid {
            return Err(invalid(&id, "originators do not cover exactly the valid positions"));
        }
        Ok(Self {
            id,
            start,
            end,
            data,
            valid,
            originators,
            exists,
        })
    }

    /// The positions `mask` selects, renumbered from zero. `mask[i]` selects
    /// position `start + i`; valid and originator intervals are clipped and
    /// renumbered to match. A non-existent series is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidSeries`] unless `mask` has one entry
    /// per position and selects at least one.
    pub fn select(&self, mask: &[bool]) -> Result<Self> {
        if !self.exists {
            return Ok(self.clone());
        }
        if mask.len() != self.data.len() {
            return Err(invalid(
                &self.id,
                format!("mask has {} entries for {} positions", mask.len(), self.data.len()),
            ));
        }
        let filter = IntervalFilter::new(mask, self.start);
        let selected = filter.selected();
        if selected == 0 {
            return Err(invalid(&self.id, "mask selects no position"));
        }
        Self::checked(
            self.id.clone(),
            0,
            last_position(&self.id, 0, selected)?,
            self.data.select(mask),
            filter.apply(self.valid.as_slice()),
            filter.apply(self.originators.as_slice()),
            true,
        )
    }

    /// The series id.
    pub fn id(&self) -> &FsId {
        &self.id
    }

    /// Position of the first value, `-1` for the non-existent sentinel.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Position of the last value, `-1` for the non-existent sentinel.
    pub fn end(&self) -> i64 {
        self.end
    }

    /// The value buffer.
    pub fn data(&self) -> &SeriesData {
        &self.data
    }

    /// Element type.
    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    /// Valid intervals, sorted.
    pub fn valid(&self) -> &IntervalSet<Interval> {
        &self.valid
    }

    /// Originator intervals, sorted.
    pub fn originators(&self) -> &IntervalSet<TaggedInterval> {
        &self.originators
    }

    /// `false` only for ids with no storage at all.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// `true` if at least one position holds real data.
    pub fn has_valid(&self) -> bool {
        !self.valid.is_empty()
    }

    /// Per-slot flags, `true` where the slot is a gap.
    pub fn gap_indicators(&self) -> Vec<bool> {
        (0..self.data.len())
            .map(|offset| !self.valid.contains(self.start + offset as i64))
            .collect()
    }

    /// Offsets of gap slots from `start`.
    pub fn gap_indices(&self) -> Vec<usize> {
        self.gap_indicators()
            .into_iter()
            .enumerate()
            .filter_map(|(i, gap)| gap.then_some(i))
            .collect()
    }

    /// Who wrote `position`, if it is valid.
    pub fn originator_at(&self, position: i64) -> Option<u64> {
        self.originators.find(position).map(Span::tag)
    }

    /// Every distinct originator tag.
    pub fn unique_originators(&self) -> BTreeSet<u64> {
        self.originators.iter().map(Span::tag).collect()
    }

    /// Renders `id|type|exists|start|end|length|values...|nValid|s|e|...|nOrig|s|e|tag...`.
    /// The trailing `|` is dropped when there is at least one originator.
    pub fn to_pipe_string(&self) -> String {
        let mut out = format!(
            "{}|{}|{}|{}|{}|{}|",
            self.id,
            self.data_type().name(),
            self.exists,
            self.start,
            self.end,
            self.data.len()
        );
        for i in 0..self.data.len() {
            out.push_str(&self.data.value_string(i));
            out.push('|');
        }
        out.push_str(&format!("{}|", self.valid.len()));
        for v in &self.valid {
            out.push_str(&format!("{}|{}|", v.start, v.end));
        }
        out.push_str(&format!("{}|", self.originators.len()));
        for o in &self.originators {
            out.push_str(&format!("{}|{}|{}|", o.start, o.end, o.tag));
        }
        if !self.originators.is_empty() {
            out.pop();
        }
        out
    }

    /// Parses the output of [`TimeSeries::to_pipe_string`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::PipeString`] naming the first bad field, or the
    /// errors of [`TimeSeries::new`] if the parsed parts are inconsistent.
    pub fn from_pipe_string(s: &str) -> Result<Self> {
        let mut fields: Vec<&str> = s.split('|').collect();
        if fields.last() == Some(&"") {
            fields.pop();
        }
        let mut cursor = PipeCursor { fields: &fields, next: 0 };

        let id = FsId::parse(cursor.take()?)?;
        let type_field = cursor.next;
        let data_type = DataType::from_name(cursor.take()?).ok_or_else(|| CodecError::PipeString {
            field: type_field,
            reason: "unknown type".to_string(),
        })?;
        let exists: bool = cursor.parse()?;
        let start: i64 = cursor.parse()?;
        let end: i64 = cursor.parse()?;
        let length: usize = cursor.parse()?;
        let first_value = cursor.next;
        let values = cursor.take_n(length)?;
        let data = SeriesData::parse_values(data_type, values, first_value)?;

        let n_valid: usize = cursor.parse()?;
        let mut valid = Vec::with_capacity(n_valid.min(cursor.remaining() / 2));
        for _ in 0..n_valid {
            let (s, e) = (cursor.parse()?, cursor.parse()?);
            valid.push(cursor.interval(s, e)?);
        }
        let n_orig: usize = cursor.parse()?;
        let mut originators = Vec::with_capacity(n_orig.min(cursor.remaining() / 3));
        for _ in 0..n_orig {
            let (s, e): (i64, i64) = (cursor.parse()?, cursor.parse()?);
            let tag: u64 = cursor.parse()?;
            let range = cursor.interval(s, e)?;
            originators.push(TaggedInterval::new(range.start, range.end, tag));
        }
        if cursor.next != fields.len() {
            return Err(CodecError::PipeString {
                field: cursor.next,
                reason: "unexpected trailing fields".to_string(),
            }
            .into());
        }
        Self::checked(id, start, end, data, valid, originators, exists)
    }

    /// Writes the binary transfer form: type name, id, start, end, exists,
    /// valid set, originator set, then a `u64` byte length and the raw
    /// little-endian values.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Stream`] if the writer fails.
    pub fn transfer_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let name = self.data_type().name().as_bytes();
        #[allow(clippy::cast_possible_truncation)] // type names are short
        out.write_all(&(name.len() as u16).to_le_bytes()).map_err(CodecError::Stream)?;
        out.write_all(name).map_err(CodecError::Stream)?;
        self.id.write_to(out)?;
        out.write_all(&self.start.to_le_bytes()).map_err(CodecError::Stream)?;
        out.write_all(&self.end.to_le_bytes()).map_err(CodecError::Stream)?;
        out.write_all(&[u8::from(self.exists)]).map_err(CodecError::Stream)?;
        self.valid.write_to(out)?;
        self.originators.write_to(out)?;
        let payload = self.data.to_le_bytes();
        out.write_all(&(payload.len() as u64).to_le_bytes()).map_err(CodecError::Stream)?;
        out.write_all(&payload).map_err(CodecError::Stream)?;
        Ok(())
    }

    /// Reads the form written by [`TimeSeries::transfer_to`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on a short or malformed stream and the errors
    /// of [`TimeSeries::new`] if the parts are inconsistent.
    pub fn transfer_from<R: Read>(input: &mut R) -> Result<Self> {
        let header = TransferHeader::read_from(input)?;
        let payload = read_payload(input)?;
        header.into_series(&payload)
    }
}

/// Position of the last of `len` values starting at `start`.
fn last_position(id: &FsId, start: i64, len: usize) -> Result<i64> {
    i64::try_from(len)
        .ok()
        .and_then(|len| start.checked_add(len - 1))
        .ok_or_else(|| invalid(id, format!("{len} values from {start} overflow the position range")))
}

fn invalid(id: &FsId, reason: impl Into<String>) -> crate::error::FsError {
    StorageError::InvalidSeries {
        id: id.to_string(),
        reason: reason.into(),
    }
    .into()
}

struct PipeCursor<'a> {
    fields: &'a [&'a str],
    next: usize,
}

impl<'a> PipeCursor<'a> {
    fn take(&mut self) -> Result<&'a str> {
        let field = self.fields.get(self.next).copied().ok_or(CodecError::PipeString {
            field: self.next,
            reason: "missing field".to_string(),
        })?;
        self.next += 1;
        Ok(field)
    }

    fn remaining(&self) -> usize {
        self.fields.len().saturating_sub(self.next)
    }

    fn take_n(&mut self, n: usize) -> Result<&'a [&'a str]> {
        let end = self.next.saturating_add(n);
        let fields = self.fields.get(self.next..end).ok_or(CodecError::PipeString {
            field: self.fields.len(),
            reason: format!("expected {n} values"),
        })?;
        self.next = end;
        Ok(fields)
    }

    fn parse<T: std::str::FromStr>(&mut self) -> Result<T> {
        let index = self.next;
        let raw = self.take()?;
        raw.parse().map_err(|_| {
            CodecError::PipeString {
                field: index,
                reason: format!("cannot parse '{raw}'"),
            }
            .into()
        })
    }

    fn interval(&self, start: i64, end: i64) -> Result<Interval> {
        if start > end {
            return Err(CodecError::PipeString {
                field: self.next - 1,
                reason: format!("interval start {start} exceeds end {end}"),
            }
            .into());
        }
        Ok(Interval::new(start, end))
    }
}

/// Everything in the transfer form before the value payload.
#[derive(Debug, Clone)]
struct TransferHeader {
    data_type: DataType,
    id: FsId,
    start: i64,
    end: i64,
    exists: bool,
    valid: IntervalSet<Interval>,
    originators: IntervalSet<TaggedInterval>,
}

impl TransferHeader {
    fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let mut len = [0u8; 2];
        input.read_exact(&mut len).map_err(CodecError::Stream)?;
        let mut name = vec![0u8; usize::from(u16::from_le_bytes(len))];
        input.read_exact(&mut name).map_err(CodecError::Stream)?;
        let data_type = std::str::from_utf8(&name)
            .ok()
            .and_then(DataType::from_name)
            .ok_or_else(|| CodecError::Frame {
                reason: format!("unknown series type {name:?}"),
            })?;
        let id = FsId::read_from(input)?;
        let start = read_i64(input)?;
        let end = read_i64(input)?;
        let mut exists = [0u8; 1];
        input.read_exact(&mut exists).map_err(CodecError::Stream)?;
        Ok(Self {
            data_type,
            id,
            start,
            end,
            exists: exists[0] != 0,
            valid: IntervalSet::read_from(input)?,
            originators: IntervalSet::read_from(input)?,
        })
    }

    fn into_series(self, payload: &[u8]) -> Result<TimeSeries> {
        let data = SeriesData::from_le_bytes(self.data_type, payload)?;
        TimeSeries::checked(
            self.id,
            self.start,
            self.end,
            data,
            self.valid.into_vec(),
            self.originators.into_vec(),
            self.exists,
        )
    }
}

fn read_payload<R: Read>(input: &mut R) -> Result<Vec<u8>> {
    let len = read_u64(input)?;
    let len = usize::try_from(len).map_err(|_| CodecError::Frame {
        reason: format!("payload length {len} too large"),
    })?;
    let mut payload = Vec::new();
    input
        .take(len as u64)
        .read_to_end(&mut payload)
        .map_err(CodecError::Stream)?;
    if payload.len() != len {
        return Err(CodecError::Frame {
            reason: format!("payload truncated: {} of {len} bytes", payload.len()),
        }
        .into());
    }
    Ok(payload)
}

/// Copies every byte read from `inner` into `seen`.
struct Tee<'a, R> {
    inner: &'a mut R,
    seen: Vec<u8>,
}

impl<R: Read> Read for Tee<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.seen.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// A series in transfer form, held as raw bytes.
///
/// The header is parsed so the id and type are known, but the value payload
/// is kept opaque and retransmitted byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesCarrier {
    id: FsId,
    data_type: DataType,
    header: Vec<u8>,
    payload: Vec<u8>,
}

impl SeriesCarrier {
    /// Reads one transfer-form series.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on a short or malformed stream.
    pub fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let mut tee = Tee {
            inner: &mut *input,
            seen: Vec::new(),
        };
        let header = TransferHeader::read_from(&mut tee)?;
        let raw_header = tee.seen;
        let payload = read_payload(input)?;
        Ok(Self {
            id: header.id,
            data_type: header.data_type,
            header: raw_header,
            payload,
        })
    }

    /// Writes the series exactly as it was read.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Stream`] if the writer fails.
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(&self.header).map_err(CodecError::Stream)?;
        out.write_all(&(self.payload.len() as u64).to_le_bytes())
            .map_err(CodecError::Stream)?;
        out.write_all(&self.payload).map_err(CodecError::Stream)?;
        Ok(())
    }

    /// The carried series id.
    pub fn id(&self) -> &FsId {
        &self.id
    }

    /// The carried element type.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Size of the value payload in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Fully decodes the carried series.
    ///
    /// # Errors
    ///
    /// Same as [`TimeSeries::transfer_from`].
    pub fn into_series(self) -> Result<TimeSeries> {
        let header = TransferHeader::read_from(&mut self.header.as_slice())?;
        header.into_series(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> FsId {
        FsId::parse(s).unwrap()
    }

    #[test]
    fn test_select_compacts_positions() {
        let series = TimeSeries::new(
            id("/pa/flux/sel"),
            10,
            SeriesData::Int(vec![0, 1, 2, 3, 4, 5]),
            vec![Interval::new(10, 11), Interval::new(13, 15)],
            vec![TaggedInterval::new(10, 11, 1), TaggedInterval::new(13, 15, 2)],
        )
        .unwrap();
        let picked = series.select(&[false, true, true, true, false, true]).unwrap();
        assert_eq!(picked.start(), 0);
        assert_eq!(picked.end(), 3);
        assert_eq!(picked.data().as_ints().unwrap(), &[1, 2, 3, 5]);
        assert_eq!(picked.valid().as_slice(), &[Interval::new(0, 0), Interval::new(2, 3)]);
        assert_eq!(picked.originator_at(3), Some(2));
        assert_eq!(picked.originator_at(1), None);

        assert!(series.select(&[true; 3]).is_err());
        assert!(series.select(&[false; 6]).is_err());
        let missing = TimeSeries::non_existent(id("/pa/none"), DataType::Int);
        assert_eq!(missing.select(&[true]).unwrap(), missing);
    }

    fn sample() -> TimeSeries {
        TimeSeries::new(
            id("/pa/flux/7"),
            100,
            SeriesData::Float(vec![1.5, 0.0, 2.25, 3.0]),
            vec![Interval::new(100, 100), Interval::new(102, 103)],
            vec![
                TaggedInterval::new(100, 100, 9),
                TaggedInterval::new(102, 102, 9),
                TaggedInterval::new(103, 103, 4),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_gap_helpers() {
        let ts = sample();
        assert_eq!(ts.end(), 103);
        assert_eq!(ts.gap_indicators(), vec![false, true, false, false]);
        assert_eq!(ts.gap_indices(), vec![1]);
        assert_eq!(ts.originator_at(103), Some(4));
        assert_eq!(ts.originator_at(101), None);
        assert_eq!(ts.unique_originators().into_iter().collect::<Vec<_>>(), vec![4, 9]);
    }

    #[test]
    fn test_from_gaps() {
        let ts = TimeSeries::from_gaps(
            id("/a/b"),
            10,
            SeriesData::Int(vec![1, 2, 3, 4, 5]),
            &[true, false, false, true],
            77,
        )
        .unwrap();
        assert_eq!(ts.valid().as_slice(), &[Interval::new(11, 12), Interval::new(14, 14)]);
        assert_eq!(ts.unique_originators().len(), 1);
    }

    #[test]
    fn test_rejects_inconsistent_metadata() {
        let err = TimeSeries::new(
            id("/a/b"),
            0,
            SeriesData::Int(vec![1, 2]),
            vec![Interval::new(0, 1)],
            vec![TaggedInterval::new(0, 0, 1)],
        )
        .unwrap_err();
        assert!(matches!(err, crate::FsError::Storage(StorageError::InvalidSeries { .. })));

        assert!(TimeSeries::new(
            id("/a/b"),
            0,
            SeriesData::Int(vec![1]),
            vec![Interval::new(0, 5)],
            vec![TaggedInterval::new(0, 5, 1)],
        )
        .is_err());
    }

    #[test]
    fn test_pipe_string_format() {
        let ts = TimeSeries::new(
            id("/x/y"),
            3,
            SeriesData::Int(vec![7, 8]),
            vec![Interval::new(3, 4)],
            vec![TaggedInterval::new(3, 4, 12)],
        )
        .unwrap();
        assert_eq!(ts.to_pipe_string(), "/x/y|int|true|3|4|2|7|8|1|3|4|1|3|4|12");
        assert_eq!(TimeSeries::from_pipe_string(&ts.to_pipe_string()).unwrap(), ts);
    }

    #[test]
    fn test_pipe_string_non_existent() {
        let ts = TimeSeries::non_existent(id("/x/none"), DataType::Double);
        let s = ts.to_pipe_string();
        assert_eq!(s, "/x/none|double|false|-1|-1|0|0|0|");
        assert_eq!(TimeSeries::from_pipe_string(&s).unwrap(), ts);
    }

    #[test]
    fn test_pipe_string_errors() {
        let err = TimeSeries::from_pipe_string("/x/y|int|true|3|4|2|7|oops|1|3|4|1|3|4|12").unwrap_err();
        assert!(matches!(err, crate::FsError::Codec(CodecError::PipeString { field: 7, .. })));
        assert!(TimeSeries::from_pipe_string("/x/y|blob|true").is_err());
        assert!(TimeSeries::from_pipe_string("/x/y|int|true|3|4|2|7").is_err());
    }

    #[test]
    fn test_pipe_string_huge_counts_are_errors() {
        let err = TimeSeries::from_pipe_string("/x/y|int|true|0|-1|0|18446744073709551615|").unwrap_err();
        assert!(matches!(err, crate::FsError::Codec(CodecError::PipeString { .. })));
        let err = TimeSeries::from_pipe_string("/x/y|int|true|0|-1|0|0|18446744073709551615|1|2").unwrap_err();
        assert!(matches!(err, crate::FsError::Codec(CodecError::PipeString { .. })));
        let err = TimeSeries::from_pipe_string("/x/y|int|true|0|0|18446744073709551615|1").unwrap_err();
        assert!(matches!(err, crate::FsError::Codec(CodecError::PipeString { .. })));
        let err = TimeSeries::from_pipe_string(&format!("/x/y|int|true|{}|{}|0|0|0|", i64::MIN, i64::MAX)).unwrap_err();
        assert!(matches!(err, crate::FsError::Storage(StorageError::InvalidSeries { .. })));
    }

    #[test]
    fn test_positions_past_i64_max_rejected() {
        let err = TimeSeries::new(id("/x/y"), i64::MAX, SeriesData::Int(vec![1, 2]), vec![], vec![]).unwrap_err();
        assert!(matches!(err, crate::FsError::Storage(StorageError::InvalidSeries { .. })));
        assert!(TimeSeries::from_gaps(id("/x/y"), i64::MAX - 1, SeriesData::Int(vec![1, 2, 3]), &[], 1).is_err());
        assert!(TimeSeries::from_gaps(id("/x/y"), i64::MAX - 1, SeriesData::Int(vec![1, 2]), &[], 1).is_ok());
    }

    #[test]
    fn test_transfer_round_trip() {
        let ts = sample();
        let mut buf = Vec::new();
        ts.transfer_to(&mut buf).unwrap();
        assert_eq!(TimeSeries::transfer_from(&mut buf.as_slice()).unwrap(), ts);
    }

    #[test]
    fn test_carrier_forwards_bytes_unchanged() {
        let a = sample();
        let b = TimeSeries::non_existent(id("/pa/flux/8"), DataType::Int);
        let mut stream = Vec::new();
        a.transfer_to(&mut stream).unwrap();
        b.transfer_to(&mut stream).unwrap();

        let mut input = stream.as_slice();
        let first = SeriesCarrier::read_from(&mut input).unwrap();
        let second = SeriesCarrier::read_from(&mut input).unwrap();
        assert!(input.is_empty());
        assert_eq!(first.id(), a.id());
        assert_eq!(first.data_type(), DataType::Float);
        assert_eq!(first.payload_len(), 16);

        let mut forwarded = Vec::new();
        first.write_to(&mut forwarded).unwrap();
        second.write_to(&mut forwarded).unwrap();
        assert_eq!(forwarded, stream);
        assert_eq!(first.into_series().unwrap(), a);
    }

    #[test]
    fn test_truncated_transfer() {
        let mut buf = Vec::new();
        sample().transfer_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        let err = TimeSeries::transfer_from(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, crate::FsError::Codec(CodecError::Frame { .. })));
    }

    #[test]
    fn test_overlay_and_bytes() {
        let mut data = SeriesData::filled(DataType::Double, 4, -1.0);
        data.overlay(1, &SeriesData::Double(vec![5.0, 6.0]));
        assert_eq!(data.as_doubles().unwrap(), &[-1.0, 5.0, 6.0, -1.0]);
        let bytes = data.slice_bytes(1, 3);
        assert_eq!(SeriesData::from_le_bytes(DataType::Double, &bytes).unwrap(), SeriesData::Double(vec![5.0, 6.0]));
        assert!(SeriesData::from_le_bytes(DataType::Int, &[0, 1, 2]).is_err());
    }
}
