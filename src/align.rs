//! Multi-channel alignment
//!
//! [`AlignmentBuffer`] merges independently arriving single-channel samples
//! that share a monotonic id (pulse id) into multi-channel rows, and releases
//! them strictly in id order.
//!
//! # Flush policy
//!
//! After each batch of [`AlignmentBuffer::add`] calls, [`AlignmentBuffer::process`]
//! releases rows from the lowest id upwards while the lowest row is:
//!
//! - complete (holds every subscribed channel), or
//! - older than the highest complete row (it can no longer complete), or
//! - pushed out because the buffer holds more than `size_buffer` rows.
//!
//! Independently, the buffer never holds more than `size_buffer * 1.2` rows:
//! `add` evicts the lowest row when that cap is exceeded. Incomplete rows are
//! delivered only with `partial` enabled. Once an id has been released (or
//! discarded) it is retired: later samples for it are dropped with a warning.

use crate::range::TimeRange;
use crate::scripting::RecordFilter;
use crate::types::{Timestamp, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of buffered rows before forced eviction
pub const DEFAULT_SIZE_BUFFER: usize = 1000;

/// Hard cap headroom over `size_buffer`
const CAPACITY_HEADROOM: f64 = 1.2;

/// One released row
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedRow {
    pub id: i64,
    pub timestamp: Timestamp,
    pub values: BTreeMap<String, Value>,
    /// Every subscribed channel is present
    pub complete: bool,
}

#[derive(Debug)]
struct PendingRow {
    timestamp: Timestamp,
    values: BTreeMap<String, Value>,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlignStats {
    pub delivered: u64,
    pub delivered_partial: u64,
    pub discarded_partial: u64,
    pub late: u64,
    pub filtered: u64,
    pub before_range: u64,
    pub evicted: u64,
}

/// Bounded id-ordered reorder buffer
pub struct AlignmentBuffer {
    channels: BTreeSet<String>,
    size_buffer: usize,
    capacity: usize,
    partial: bool,
    rows: BTreeMap<i64, PendingRow>,
    last_flushed: Option<i64>,
    filter: Option<RecordFilter>,
    range: Option<Arc<TimeRange>>,
    /// Rows released by `add` under memory pressure, handed out by `process`
    evicted: Vec<AlignedRow>,
    stats: AlignStats,
}

impl AlignmentBuffer {
    /// Buffer over `channels` with partial delivery on and the default size
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut buffer = Self {
            channels: channels.into_iter().map(Into::into).collect(),
            size_buffer: DEFAULT_SIZE_BUFFER,
            capacity: 0,
            partial: true,
            rows: BTreeMap::new(),
            last_flushed: None,
            filter: None,
            range: None,
            evicted: Vec::new(),
            stats: AlignStats::default(),
        };
        buffer.capacity = capacity_for(buffer.size_buffer);
        buffer
    }

    pub fn with_size_buffer(mut self, size_buffer: usize) -> Self {
        self.size_buffer = size_buffer.max(1);
        self.capacity = capacity_for(self.size_buffer);
        self
    }

    /// Deliver incomplete rows instead of discarding them
    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn with_filter(mut self, filter: RecordFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Rows before the range start are retired without delivery
    pub fn with_range(mut self, range: Arc<TimeRange>) -> Self {
        self.range = Some(range);
        self
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last_flushed(&self) -> Option<i64> {
        self.last_flushed
    }

    pub fn stats(&self) -> AlignStats {
        self.stats
    }

    /// Merge one sample into the row for `id`
    pub fn add(&mut self, id: i64, timestamp: Timestamp, channel: &str, value: Value) {
        if !self.channels.contains(channel) {
            debug!("Ignoring unsubscribed channel {} at id {}", channel, id);
            return;
        }
        if let Some(last) = self.last_flushed {
            if id <= last {
                warn!("Invalid ID {} - last sent ID {}", id, last);
                self.stats.late += 1;
                return;
            }
        }

        self.rows
            .entry(id)
            .or_insert_with(|| PendingRow {
                timestamp,
                values: BTreeMap::new(),
            })
            .values
            .insert(channel.to_string(), value);

        while self.rows.len() > self.capacity {
            let Some((id, row)) = self.rows.pop_first() else {
                break;
            };
            self.stats.evicted += 1;
            if let Some(released) = self.release(id, row) {
                self.evicted.push(released);
            }
        }
    }

    fn is_complete(&self, row: &PendingRow) -> bool {
        row.values.len() == self.channels.len()
    }

    /// Release every row that is due, in increasing id order
    pub fn process(&mut self) -> Vec<AlignedRow> {
        let mut out = std::mem::take(&mut self.evicted);

        let last_complete = self
            .rows
            .iter()
            .rev()
            .find(|(_, row)| self.is_complete(row))
            .map(|(id, _)| *id);

        while let Some((&id, row)) = self.rows.first_key_value() {
            let due = self.is_complete(row)
                || last_complete.is_some_and(|complete| complete > id)
                || self.rows.len() > self.size_buffer;
            if !due {
                break;
            }
            let Some((id, row)) = self.rows.pop_first() else {
                break;
            };
            if let Some(released) = self.release(id, row) {
                out.push(released);
            }
        }
        out
    }

    /// Release everything still buffered (stream end)
    pub fn flush_all(&mut self) -> Vec<AlignedRow> {
        let mut out = std::mem::take(&mut self.evicted);
        while let Some((id, row)) = self.rows.pop_first() {
            if let Some(released) = self.release(id, row) {
                out.push(released);
            }
        }
        out
    }

    /// Retire `id` and decide whether its row is delivered
    fn release(&mut self, id: i64, row: PendingRow) -> Option<AlignedRow> {
        if let Some(last) = self.last_flushed {
            if id <= last {
                warn!("Invalid ID {} - last sent ID {}", id, last);
                self.stats.late += 1;
                return None;
            }
        }
        self.last_flushed = Some(id);

        let complete = self.is_complete(&row);
        if !complete && !self.partial {
            debug!("Discarding partial message: {}", id);
            self.stats.discarded_partial += 1;
            return None;
        }

        if let Some(range) = &self.range {
            if !range.has_started_at(row.timestamp, Some(id)) {
                self.stats.before_range += 1;
                return None;
            }
        }

        if let Some(filter) = &self.filter {
            match filter.evaluate(id, row.timestamp, &row.values) {
                Ok(true) => {}
                Ok(false) => {
                    self.stats.filtered += 1;
                    return None;
                }
                Err(e) => {
                    warn!("Error processing filter at id {}: {}", id, e);
                    self.stats.filtered += 1;
                    return None;
                }
            }
        }

        self.stats.delivered += 1;
        if !complete {
            self.stats.delivered_partial += 1;
        }
        Some(AlignedRow {
            id,
            timestamp: row.timestamp,
            values: row.values,
            complete,
        })
    }
}

fn capacity_for(size_buffer: usize) -> usize {
    ((size_buffer as f64) * CAPACITY_HEADROOM) as usize
}

impl std::fmt::Debug for AlignmentBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignmentBuffer")
            .field("channels", &self.channels)
            .field("rows", &self.rows.len())
            .field("last_flushed", &self.last_flushed)
            .field("stats", &self.stats)
            .finish()
    }
}
