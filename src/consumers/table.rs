//! In-memory table consumer

use crate::error::Result;
use crate::source::{ChannelHeader, Listener, SourceInfo};
use crate::types::{RecordTime, Value};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// One received record of a channel
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub time: RecordTime,
    pub id: Option<i64>,
    pub value: Value,
}

/// Column used to join channels in [`Table::merged`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableIndex {
    #[default]
    Timestamp,
    Id,
}

/// Outer join of all channels on one index
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergedTable {
    pub columns: Vec<String>,
    /// Index value (seconds for timestamps) and one cell per column
    pub rows: Vec<(f64, Vec<Option<Value>>)>,
}

/// Collects records per channel.
///
/// A header (re)starts the channel's column, so a channel whose format
/// changed keeps only the records of its latest format.
#[derive(Debug, Default)]
pub struct Table {
    data: Mutex<BTreeMap<String, Vec<TableRow>>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels(&self) -> Vec<String> {
        self.data.lock().keys().cloned().collect()
    }

    pub fn rows(&self, channel: &str) -> Vec<TableRow> {
        self.data.lock().get(channel).cloned().unwrap_or_default()
    }

    /// Records across all channels
    pub fn len(&self) -> usize {
        self.data.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.data.lock().clear();
    }

    /// Join channels on `index`, filling gaps with the last known value.
    ///
    /// Records without an index value (no id, or an unparseable time) are
    /// left out.
    pub fn merged(&self, index: TableIndex) -> MergedTable {
        let data = self.data.lock();
        let columns: Vec<String> = data.keys().cloned().collect();

        let mut cells: Vec<(f64, usize, Value)> = Vec::new();
        for (column, rows) in data.values().enumerate() {
            for row in rows {
                let key = match index {
                    TableIndex::Timestamp => row.time.as_secs_f64(),
                    TableIndex::Id => row.id.map(|id| id as f64),
                };
                if let Some(key) = key {
                    cells.push((key, column, row.value.clone()));
                }
            }
        }
        cells.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut last: Vec<Option<Value>> = vec![None; columns.len()];
        let mut rows: Vec<(f64, Vec<Option<Value>>)> = Vec::new();
        for (key, column, value) in cells {
            last[column] = Some(value);
            match rows.last_mut() {
                Some((k, row)) if *k == key => row[column] = last[column].clone(),
                _ => rows.push((key, last.clone())),
            }
        }

        MergedTable { columns, rows }
    }
}

impl Listener for Table {
    fn on_channel_header(&self, _source: &SourceInfo, header: &ChannelHeader) -> Result<()> {
        self.data.lock().insert(header.name.clone(), Vec::new());
        Ok(())
    }

    fn on_channel_record(
        &self,
        _source: &SourceInfo,
        name: &str,
        timestamp: &RecordTime,
        id: Option<i64>,
        value: &Value,
    ) -> Result<()> {
        self.data
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(TableRow {
                time: timestamp.clone(),
                id,
                value: value.clone(),
            });
        Ok(())
    }

    fn on_channel_completed(&self, _source: &SourceInfo, _name: &str) -> Result<()> {
        Ok(())
    }

    fn close(&self) {
        self.clear();
    }
}
