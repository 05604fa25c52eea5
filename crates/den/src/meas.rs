//! Measurement data model and query descriptors.
//!
//! A [`Measurement`] is the unit every tier stores: a `(id, time, value, flag, source)`
//! tuple. Queries are described by [`QueryInterval`] and [`QueryTimePoint`], and
//! per-series aggregates by [`MinMax`] and [`Statistic`].

use crate::bloom;
use crate::bytes::ByteReader;
use crate::error::Result;
use std::ops::{Add, AddAssign};
use std::time::{SystemTime, UNIX_EPOCH};

/// Series identifier.
pub type Id = u64;
/// Timestamp. The engine treats it as milliseconds since the Unix epoch.
pub type Time = u64;
/// Measurement value.
pub type Value = f64;
/// Measurement flag. Zero in a query filter matches every flag.
pub type Flag = u32;

/// Smallest representable time.
pub const MIN_TIME: Time = Time::MIN;
/// Largest representable time.
pub const MAX_TIME: Time = Time::MAX;

/// Tolerance below which two values are considered equal.
pub const EPSILON: Value = 1e-5;

/// Reserved flag values.
pub mod flags {
    use super::Flag;

    /// Marks a time-point answer for which no measurement exists.
    pub const NO_DATA: Flag = 0xFFFF_FFFE;
}

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
pub fn current_time() -> Time {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Time)
        .unwrap_or(0)
}

/// A single time series sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct Measurement {
    /// Series identifier.
    pub id: Id,
    /// Sample timestamp.
    pub time: Time,
    /// Sample value.
    pub value: Value,
    /// User flag.
    pub flag: Flag,
    /// Source tag.
    pub source: Flag,
}

impl Measurement {
    /// Serialized size in bytes.
    pub const SIZE: usize = 32;

    /// Creates a measurement with zero flag and source.
    pub fn new(id: Id, time: Time, value: Value) -> Self {
        Self {
            id,
            time,
            value,
            flag: 0,
            source: 0,
        }
    }

    /// Creates a measurement with every field set.
    pub fn with_flag(id: Id, time: Time, value: Value, flag: Flag, source: Flag) -> Self {
        Self {
            id,
            time,
            value,
            flag,
            source,
        }
    }

    /// The "no data" answer for `id` at `time`.
    pub fn empty(id: Id, time: Time) -> Self {
        Self {
            id,
            time,
            value: 0.0,
            flag: flags::NO_DATA,
            source: flags::NO_DATA,
        }
    }

    /// Returns true if this is a "no data" sentinel.
    pub fn is_empty(&self) -> bool {
        self.flag == flags::NO_DATA
    }

    /// Returns true if `flag` is zero or equals this measurement's flag.
    pub fn in_flag(&self, flag: Flag) -> bool {
        flag == 0 || flag == self.flag
    }

    /// Returns true if `ids` is empty or contains this measurement's id.
    pub fn in_ids(&self, ids: &[Id]) -> bool {
        ids.is_empty() || ids.contains(&self.id)
    }

    /// Returns true if `from <= time <= to`.
    pub fn in_interval(&self, from: Time, to: Time) -> bool {
        from <= self.time && self.time <= to
    }

    /// Returns true if the measurement satisfies every filter of `query`.
    pub fn in_query(&self, query: &QueryInterval) -> bool {
        self.in_ids(&query.ids) && self.in_flag(query.flag) && self.in_interval(query.from, query.to)
    }

    /// Writes the 32-byte little-endian representation.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        // Id (8 bytes)
        out.extend_from_slice(&self.id.to_le_bytes());
        // Time (8 bytes)
        out.extend_from_slice(&self.time.to_le_bytes());
        // Value (8 bytes)
        out.extend_from_slice(&self.value.to_le_bytes());
        // Flag (4 bytes)
        out.extend_from_slice(&self.flag.to_le_bytes());
        // Source (4 bytes)
        out.extend_from_slice(&self.source.to_le_bytes());
    }

    pub(crate) fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            id: reader.u64()?,
            time: reader.u64()?,
            value: reader.f64()?,
            flag: reader.u32()?,
            source: reader.u32()?,
        })
    }

    /// Decodes a measurement from exactly [`Measurement::SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns `DenError::Corrupted` if `bytes` is too short.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read_from(&mut ByteReader::new(bytes, "measurement"))
    }
}

impl PartialEq for Measurement {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.time == other.time
            && self.flag == other.flag
            && self.source == other.source
            && (self.value - other.value).abs() < EPSILON
    }
}

/// Interval query: every measurement of `ids` with `from <= time <= to`
/// whose flag matches `flag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryInterval {
    /// Requested series. Empty means all series.
    pub ids: Vec<Id>,
    /// Flag filter. Zero matches every flag.
    pub flag: Flag,
    /// Inclusive lower bound.
    pub from: Time,
    /// Inclusive upper bound.
    pub to: Time,
}

impl QueryInterval {
    /// Creates an interval query.
    pub fn new(ids: Vec<Id>, flag: Flag, from: Time, to: Time) -> Self {
        Self {
            ids,
            flag,
            from,
            to,
        }
    }

    /// Returns a copy restricted to one series and a narrower time range.
    pub fn narrowed(&self, id: Id, from: Time, to: Time) -> Self {
        Self {
            ids: vec![id],
            flag: self.flag,
            from,
            to,
        }
    }
}

/// Time-point query: for each id, the latest measurement with `time <= time_point`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTimePoint {
    /// Requested series.
    pub ids: Vec<Id>,
    /// Flag filter. Zero matches every flag.
    pub flag: Flag,
    /// Inclusive upper bound.
    pub time_point: Time,
}

impl QueryTimePoint {
    /// Creates a time-point query.
    pub fn new(ids: Vec<Id>, flag: Flag, time_point: Time) -> Self {
        Self {
            ids,
            flag,
            time_point,
        }
    }
}

/// Earliest and latest measurement of one series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMax {
    /// Measurement with the smallest time.
    pub min: Measurement,
    /// Measurement with the largest time.
    pub max: Measurement,
}

impl MinMax {
    /// Creates an entry from a single measurement.
    pub fn new(m: Measurement) -> Self {
        Self { min: m, max: m }
    }

    /// Widens the entry to cover `m`.
    pub fn update(&mut self, m: &Measurement) {
        if m.time < self.min.time {
            self.min = *m;
        }
        if m.time >= self.max.time {
            self.max = *m;
        }
    }

    /// Widens the entry to cover `other`.
    pub fn merge(&mut self, other: &MinMax) {
        self.update(&other.min);
        self.update(&other.max);
    }
}

/// Aggregate over a set of measurements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistic {
    /// Smallest time seen.
    pub min_time: Time,
    /// Largest time seen.
    pub max_time: Time,
    /// Number of measurements.
    pub count: u64,
    /// Bloom filter over the flags seen.
    pub flag_bloom: u64,
    /// Smallest value seen.
    pub min_value: Value,
    /// Largest value seen.
    pub max_value: Value,
    /// Sum of the values.
    pub sum: Value,
}

impl Default for Statistic {
    fn default() -> Self {
        Self {
            min_time: MAX_TIME,
            max_time: MIN_TIME,
            count: 0,
            flag_bloom: bloom::bloom_empty(),
            min_value: Value::MAX,
            max_value: Value::MIN,
            sum: 0.0,
        }
    }
}

impl Statistic {
    /// Creates an empty statistic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no measurement has been accounted.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Accounts one measurement.
    pub fn update(&mut self, m: &Measurement) {
        self.min_time = self.min_time.min(m.time);
        self.max_time = self.max_time.max(m.time);
        self.count += 1;
        self.flag_bloom = bloom::bloom_add(self.flag_bloom, u64::from(m.flag));
        self.min_value = self.min_value.min(m.value);
        self.max_value = self.max_value.max(m.value);
        self.sum += m.value;
    }

    /// Accounts every measurement behind `other`.
    pub fn merge(&mut self, other: &Statistic) {
        if other.is_empty() {
            return;
        }
        self.min_time = self.min_time.min(other.min_time);
        self.max_time = self.max_time.max(other.max_time);
        self.count += other.count;
        self.flag_bloom = bloom::bloom_combine(self.flag_bloom, other.flag_bloom);
        self.min_value = self.min_value.min(other.min_value);
        self.max_value = self.max_value.max(other.max_value);
        self.sum += other.sum;
    }
}

/// Outcome of an append.
///
/// Rejected writes are ordinary results, not errors: `ignored` counts
/// measurements that were refused and `error_message` says why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendResult {
    /// Number of measurements stored.
    pub writed: usize,
    /// Number of measurements refused.
    pub ignored: usize,
    /// Reason for the last refusal, if any.
    pub error_message: Option<String>,
}

impl AppendResult {
    /// One measurement stored.
    pub fn ok() -> Self {
        Self {
            writed: 1,
            ignored: 0,
            error_message: None,
        }
    }

    /// One measurement refused for `reason`.
    pub fn ignored(reason: impl Into<String>) -> Self {
        Self {
            writed: 0,
            ignored: 1,
            error_message: Some(reason.into()),
        }
    }
}

impl Add for AppendResult {
    type Output = AppendResult;

    fn add(mut self, rhs: AppendResult) -> AppendResult {
        self += rhs;
        self
    }
}

impl AddAssign for AppendResult {
    fn add_assign(&mut self, rhs: AppendResult) {
        self.writed += rhs.writed;
        self.ignored += rhs.ignored;
        if rhs.error_message.is_some() {
            self.error_message = rhs.error_message;
        }
    }
}

/// Sorts `values` by `(id, time)` keeping arrival order for equal keys.
pub fn sort_by_id_time(values: &mut [Measurement]) {
    values.sort_by(|a, b| a.id.cmp(&b.id).then(a.time.cmp(&b.time)));
}
