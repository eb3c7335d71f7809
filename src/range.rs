//! Query range resolution
//!
//! [`TimeRange`] turns a query's raw `start`/`end` into a running predicate.
//! Exactly one [`RangeMode`] governs a range: in time mode bounds are UTC
//! nanosecond timestamps, in id mode they are monotonic record ids. The two
//! are never mixed; a bound that does not fit the mode is rejected when the
//! range is built, i.e. at `request()` time.
//!
//! # Time bounds
//!
//! - numbers with magnitude >= 1e9 are absolute epoch seconds
//! - smaller numbers are offsets in seconds from the moment of resolution
//!   (`-60` = one minute ago, `0` = now)
//! - strings are parsed as numbers first, then as RFC 3339,
//!   `YYYY-MM-DD HH:MM:SS[.f]`, `YYYY-MM-DDTHH:MM:SS[.f]` or `YYYY-MM-DD` (UTC)

use crate::config::{BoundSpec, Query, RangeMode};
use crate::error::{DataHubError, Result};
use crate::source::CancelToken;
use crate::types::{now_nanos, timestamp_to_datetime, timestamp_to_string, Timestamp};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Numbers at or above this magnitude are absolute epoch seconds
const ABSOLUTE_TIME_THRESHOLD: f64 = 1e9;

/// Granularity of `wait_end` sleeps, bounds abort latency
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Sentinel for "no record observed yet"
const NOTHING_OBSERVED: i64 = i64::MIN;

/// A resolved query range
#[derive(Debug)]
pub struct TimeRange {
    mode: RangeMode,
    /// Nanoseconds (time mode) or id (id mode)
    start: Option<i64>,
    end: Option<i64>,
    /// Highest position observed from incoming records
    position: AtomicI64,
}

impl Clone for TimeRange {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode,
            start: self.start,
            end: self.end,
            position: AtomicI64::new(self.position.load(Ordering::Relaxed)),
        }
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl TimeRange {
    /// A range with neither start nor end
    pub fn unbounded() -> Self {
        Self::new(RangeMode::Time, None, None)
    }

    fn new(mode: RangeMode, start: Option<i64>, end: Option<i64>) -> Self {
        Self {
            mode,
            start,
            end,
            position: AtomicI64::new(NOTHING_OBSERVED),
        }
    }

    /// Time range from already resolved nanosecond timestamps
    pub fn from_times(start: Option<Timestamp>, end: Option<Timestamp>) -> Result<Self> {
        check_order(start, end)?;
        Ok(Self::new(RangeMode::Time, start, end))
    }

    /// Id range from explicit ids
    pub fn from_ids(start: Option<i64>, end: Option<i64>) -> Result<Self> {
        check_order(start, end)?;
        Ok(Self::new(RangeMode::Id, start, end))
    }

    /// Resolve a query's bounds relative to the current wall clock
    pub fn from_query(query: &Query) -> Result<Self> {
        Self::resolve(query, now_nanos())
    }

    /// Resolve a query's bounds, with relative offsets taken from `now`
    pub fn resolve(query: &Query, now: Timestamp) -> Result<Self> {
        let mode = query.range_mode();
        let start = resolve_bound(query.start.as_ref(), mode, now, "start")?;
        let end = resolve_bound(query.end.as_ref(), mode, now, "end")?;
        check_order(start, end)?;
        Ok(Self::new(mode, start, end))
    }

    pub fn mode(&self) -> RangeMode {
        self.mode
    }

    pub fn start(&self) -> Option<i64> {
        self.start
    }

    pub fn end(&self) -> Option<i64> {
        self.end
    }

    pub fn is_bounded(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    /// Record the position of an incoming record
    pub fn observe(&self, timestamp: Timestamp, id: Option<i64>) {
        if let Some(pos) = self.position_of(timestamp, id) {
            self.position.fetch_max(pos, Ordering::AcqRel);
        }
    }

    fn position_of(&self, timestamp: Timestamp, id: Option<i64>) -> Option<i64> {
        match self.mode {
            RangeMode::Time => Some(timestamp),
            RangeMode::Id => id,
        }
    }

    fn current_position(&self) -> Option<i64> {
        match self.mode {
            RangeMode::Time => Some(now_nanos()),
            RangeMode::Id => {
                let pos = self.position.load(Ordering::Acquire);
                (pos != NOTHING_OBSERVED).then_some(pos)
            }
        }
    }

    /// True once the current position (wall clock, or last observed id) reached `start`
    pub fn has_started(&self) -> bool {
        match self.start {
            None => true,
            Some(start) => self.current_position().is_some_and(|pos| pos >= start),
        }
    }

    /// True once the current position reached `end`; never for open-ended ranges
    pub fn has_ended(&self) -> bool {
        match self.end {
            None => false,
            Some(end) => self.current_position().is_some_and(|pos| pos >= end),
        }
    }

    /// Whether a record at this position is at or after `start`
    pub fn has_started_at(&self, timestamp: Timestamp, id: Option<i64>) -> bool {
        match (self.start, self.position_of(timestamp, id)) {
            (None, _) => true,
            (Some(start), Some(pos)) => pos >= start,
            (Some(_), None) => true,
        }
    }

    /// Whether a record at this position is at or past `end`
    pub fn has_ended_at(&self, timestamp: Timestamp, id: Option<i64>) -> bool {
        match (self.end, self.position_of(timestamp, id)) {
            (Some(end), Some(pos)) => pos >= end,
            _ => false,
        }
    }

    /// Whether a record lies inside `[start, end]`
    pub fn contains(&self, timestamp: Timestamp, id: Option<i64>) -> bool {
        let pos = match self.position_of(timestamp, id) {
            Some(pos) => pos,
            None => return true,
        };
        self.start.map_or(true, |s| pos >= s) && self.end.map_or(true, |e| pos <= e)
    }

    /// Time left until wall clock passes `end + delay`; zero for unbounded or id ranges
    pub fn remaining_until_end(&self, delay: Duration) -> Duration {
        match (self.mode, self.end) {
            (RangeMode::Time, Some(end)) => {
                let target = end.saturating_add(delay.as_nanos() as i64);
                let left = target.saturating_sub(now_nanos());
                Duration::from_nanos(left.max(0) as u64)
            }
            _ => Duration::ZERO,
        }
    }

    /// Block until wall clock has advanced past `end + delay`.
    ///
    /// No-op for open-ended ranges and id ranges. Returns `Aborted` if the
    /// token is cancelled while waiting.
    pub fn wait_end(&self, delay: Duration, cancel: &CancelToken) -> Result<()> {
        loop {
            let left = self.remaining_until_end(delay);
            if left.is_zero() {
                return Ok(());
            }
            cancel.check()?;
            std::thread::sleep(left.min(WAIT_SLICE));
        }
    }

    /// Start as a UTC datetime (time mode only)
    pub fn start_datetime(&self) -> Option<DateTime<Utc>> {
        self.time_bound(self.start).map(timestamp_to_datetime)
    }

    /// End as a UTC datetime (time mode only)
    pub fn end_datetime(&self) -> Option<DateTime<Utc>> {
        self.time_bound(self.end).map(timestamp_to_datetime)
    }

    /// Start as an ISO-8601 string (time mode only)
    pub fn start_str(&self) -> Option<String> {
        self.time_bound(self.start).map(timestamp_to_string)
    }

    /// End as an ISO-8601 string (time mode only)
    pub fn end_str(&self) -> Option<String> {
        self.time_bound(self.end).map(timestamp_to_string)
    }

    fn time_bound(&self, bound: Option<i64>) -> Option<Timestamp> {
        match self.mode {
            RangeMode::Time => bound,
            RangeMode::Id => None,
        }
    }
}

fn check_order(start: Option<i64>, end: Option<i64>) -> Result<()> {
    match (start, end) {
        (Some(s), Some(e)) if s > e => Err(DataHubError::Config(format!(
            "Range start {} is after end {}",
            s, e
        ))),
        _ => Ok(()),
    }
}

fn resolve_bound(
    bound: Option<&BoundSpec>,
    mode: RangeMode,
    now: Timestamp,
    what: &str,
) -> Result<Option<i64>> {
    let Some(bound) = bound else {
        return Ok(None);
    };
    let resolved = match mode {
        RangeMode::Id => resolve_id(bound),
        RangeMode::Time => resolve_time(bound, now),
    };
    resolved.map(Some).ok_or_else(|| {
        DataHubError::Config(format!(
            "Invalid {} for {:?} range: {:?}",
            what, mode, bound
        ))
    })
}

fn resolve_id(bound: &BoundSpec) -> Option<i64> {
    match bound {
        BoundSpec::Int(v) => Some(*v),
        BoundSpec::Float(_) => None,
        BoundSpec::Text(s) => s.trim().parse::<i64>().ok(),
    }
}

fn resolve_time(bound: &BoundSpec, now: Timestamp) -> Option<Timestamp> {
    match bound {
        BoundSpec::Int(v) => Some(seconds_to_timestamp(*v as f64, now)),
        BoundSpec::Float(v) if v.is_finite() => Some(seconds_to_timestamp(*v, now)),
        BoundSpec::Float(_) => None,
        BoundSpec::Text(s) => {
            let s = s.trim();
            if let Ok(v) = s.parse::<f64>() {
                return v.is_finite().then(|| seconds_to_timestamp(v, now));
            }
            parse_datetime(s).and_then(|dt| dt.timestamp_nanos_opt())
        }
    }
}

fn seconds_to_timestamp(secs: f64, now: Timestamp) -> Timestamp {
    let nanos = (secs * 1e9) as i64;
    if secs.abs() >= ABSOLUTE_TIME_THRESHOLD {
        nanos
    } else {
        now.saturating_add(nanos)
    }
}

/// Parse the datetime formats accepted for time bounds (naive values are UTC)
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
