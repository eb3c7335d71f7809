//! Message-bus retrieval with id alignment
//!
//! Entries arrive per channel as `(channel, id, timestamp, value)` and are
//! merged into rows by an [`AlignmentBuffer`] before delivery, so consumers
//! see all channels of one pulse together. The bus itself is a [`BusClient`]
//! collaborator; [`MemoryBus`] is an in-process implementation.
//!
//! Query options:
//!
//! - `partial_msg` (default true) - deliver rows missing some channels
//! - `size_buffer` (default 1000) - rows buffered before forced release
//! - `receive_timeout` (default 0.1) - seconds to block per read
//! - `filter` - record filter expression, see [`crate::scripting`]

use crate::align::{AlignedRow, AlignmentBuffer, DEFAULT_SIZE_BUFFER};
use crate::config::Query;
use crate::error::{DataHubError, Result};
use crate::scripting::RecordFilter;
use crate::source::{Adapter, CatalogEntry, ReceiveOptions, RunContext};
use crate::types::{ArrayValue, Timestamp, Value};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TYPE_NAME: &str = "bus";

/// Entries requested per subscribed channel and read
pub const ENTRIES_PER_CHANNEL: usize = 5;

/// Default blocking time of one read
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// One message of a channel stream
#[derive(Debug, Clone, PartialEq)]
pub struct BusEntry {
    pub channel: String,
    pub id: i64,
    pub timestamp: Timestamp,
    pub value: Value,
}

impl BusEntry {
    pub fn new(channel: impl Into<String>, id: i64, timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            channel: channel.into(),
            id,
            timestamp,
            value: value.into(),
        }
    }
}

/// Consumer side of a message bus
pub trait BusClient: Send {
    /// Start consuming the given channel streams
    fn subscribe(&mut self, channels: &[String]) -> Result<()>;

    /// Up to `max` entries, blocking at most `block` for the first.
    ///
    /// An empty batch means nothing arrived in time; None means the bus is
    /// closed and will deliver nothing more.
    fn read(&mut self, max: usize, block: Duration) -> Result<Option<Vec<BusEntry>>>;

    /// Stop consuming; called once after the last read
    fn unsubscribe(&mut self) -> Result<()>;

    /// Streams whose name contains `pattern`
    fn search(&mut self, pattern: &str) -> Result<Vec<CatalogEntry>>;

    fn describe(&self) -> String;
}

// ==================== Memory Bus ====================

/// Producer handle of a [`MemoryBus`]
#[derive(Clone)]
pub struct MemoryBusPublisher {
    sender: Sender<BusEntry>,
    streams: Arc<Mutex<BTreeSet<String>>>,
}

impl MemoryBusPublisher {
    pub fn publish(&self, entry: BusEntry) -> Result<()> {
        self.streams.lock().insert(entry.channel.clone());
        self.sender
            .send(entry)
            .map_err(|_| DataHubError::Backend("memory bus closed".into()))
    }

    pub fn publish_value(
        &self,
        channel: &str,
        id: i64,
        timestamp: Timestamp,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.publish(BusEntry::new(channel, id, timestamp, value))
    }
}

/// In-process bus on a crossbeam channel.
///
/// The bus closes once every publisher has been dropped and the queue is
/// drained.
pub struct MemoryBus {
    receiver: Receiver<BusEntry>,
    streams: Arc<Mutex<BTreeSet<String>>>,
    subscribed: Option<HashSet<String>>,
    disconnected: bool,
}

impl MemoryBus {
    pub fn new() -> (MemoryBusPublisher, MemoryBus) {
        let (sender, receiver) = unbounded();
        let streams = Arc::new(Mutex::new(BTreeSet::new()));
        (
            MemoryBusPublisher {
                sender,
                streams: streams.clone(),
            },
            MemoryBus {
                receiver,
                streams,
                subscribed: None,
                disconnected: false,
            },
        )
    }

    /// A closed bus preloaded with entries from a JSON-lines file
    ///
    /// Each line is `{"channel": .., "id": .., "timestamp": .., "value": ..}`.
    pub fn replay(path: &std::path::Path) -> Result<MemoryBus> {
        let file = std::fs::File::open(path).map_err(|e| {
            DataHubError::Config(format!("Failed to open replay file {:?}: {}", path, e))
        })?;
        let (publisher, bus) = MemoryBus::new();
        let mut count = 0usize;
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ReplayRecord = serde_json::from_str(&line).map_err(|e| {
                DataHubError::Config(format!("{:?} line {}: {}", path, number + 1, e))
            })?;
            let value = json_to_value(&record.value).ok_or_else(|| {
                DataHubError::Config(format!(
                    "{:?} line {}: unsupported value",
                    path,
                    number + 1
                ))
            })?;
            publisher.publish(BusEntry::new(record.channel, record.id, record.timestamp, value))?;
            count += 1;
        }
        debug!("Loaded {} bus entries from {:?}", count, path);
        Ok(bus)
    }
}

impl BusClient for MemoryBus {
    fn subscribe(&mut self, channels: &[String]) -> Result<()> {
        self.subscribed = Some(channels.iter().cloned().collect());
        Ok(())
    }

    fn read(&mut self, max: usize, block: Duration) -> Result<Option<Vec<BusEntry>>> {
        if self.disconnected {
            return Ok(None);
        }

        let mut batch = Vec::new();
        match self.receiver.recv_timeout(block) {
            Ok(entry) => batch.push(entry),
            Err(RecvTimeoutError::Timeout) => return Ok(Some(batch)),
            Err(RecvTimeoutError::Disconnected) => {
                self.disconnected = true;
                return Ok(None);
            }
        }
        while batch.len() < max {
            match self.receiver.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }

        if let Some(subscribed) = &self.subscribed {
            batch.retain(|entry| subscribed.contains(&entry.channel));
        }
        Ok(Some(batch))
    }

    fn unsubscribe(&mut self) -> Result<()> {
        self.subscribed = None;
        Ok(())
    }

    fn search(&mut self, pattern: &str) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .streams
            .lock()
            .iter()
            .filter(|name| name.contains(pattern))
            .map(CatalogEntry::named)
            .collect())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Deserialize)]
struct ReplayRecord {
    channel: String,
    id: i64,
    timestamp: Timestamp,
    value: serde_json::Value,
}

/// Scalars, strings and flat numeric arrays
fn json_to_value(json: &serde_json::Value) -> Option<Value> {
    match json {
        serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_u64().map(Value::UInt))
            .or_else(|| n.as_f64().map(Value::Float)),
        serde_json::Value::String(s) => Some(Value::Str(s.clone())),
        serde_json::Value::Array(items) => {
            if items.iter().all(|v| v.is_i64()) {
                Some(Value::Array(ArrayValue::from_i64(
                    items.iter().filter_map(|v| v.as_i64()).collect(),
                )))
            } else {
                let floats: Option<Vec<f64>> = items.iter().map(|v| v.as_f64()).collect();
                floats.map(|v| Value::Array(ArrayValue::from_f64(v)))
            }
        }
        _ => None,
    }
}

// ==================== Adapter ====================

/// Options of the `bus` source type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusOptions {
    /// Bus address, informational for the built-in client
    #[serde(default)]
    pub url: Option<String>,

    /// JSON-lines file replayed through a [`MemoryBus`]
    #[serde(default)]
    pub replay: Option<PathBuf>,
}

/// Aligning message-bus source
pub struct BusAdapter {
    client: Box<dyn BusClient>,
    url: Option<String>,
}

impl BusAdapter {
    pub fn new(client: Box<dyn BusClient>) -> Self {
        Self { client, url: None }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Build from task options; only file replay is built in
    pub fn from_options(options: &BusOptions) -> Result<Self> {
        let replay = options.replay.as_ref().ok_or_else(|| {
            DataHubError::Config("bus source needs a client or a `replay` file".into())
        })?;
        let adapter = Self::new(Box::new(MemoryBus::replay(replay)?));
        Ok(match &options.url {
            Some(url) => adapter.with_url(url.clone()),
            None => adapter,
        })
    }

    fn compile_filter(query: &Query) -> Result<Option<RecordFilter>> {
        query
            .filter
            .as_deref()
            .map(|source| {
                RecordFilter::compile(source).map_err(|e| DataHubError::Config(e.to_string()))
            })
            .transpose()
    }

    fn deliver(ctx: &RunContext, rows: Vec<AlignedRow>) {
        let options = ReceiveOptions {
            check_changes: true,
            check_types: true,
            metadata: None,
        };
        for row in rows {
            for (name, value) in row.values {
                ctx.receive_with(&name, value, Some(row.timestamp), Some(row.id), &options);
            }
        }
    }

    fn consume(&mut self, align: &mut AlignmentBuffer, ctx: &RunContext, max: usize, block: Duration) -> Result<()> {
        loop {
            ctx.cancel().check()?;
            if ctx.range().has_ended() {
                debug!("Range ended");
                return Ok(());
            }
            match self.client.read(max, block)? {
                Some(entries) => {
                    if entries.is_empty() {
                        continue;
                    }
                    for entry in entries {
                        align.add(entry.id, entry.timestamp, &entry.channel, entry.value);
                    }
                    Self::deliver(ctx, align.process());
                }
                None => {
                    debug!("Bus closed");
                    return Ok(());
                }
            }
        }
    }
}

impl Adapter for BusAdapter {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn target(&self) -> Option<String> {
        Some(self.url.clone().unwrap_or_else(|| self.client.describe()))
    }

    fn validate(&self, query: &Query) -> Result<()> {
        if query.channels.is_empty() {
            return Err(DataHubError::Config("no channels requested".into()));
        }
        Self::compile_filter(query).map(|_| ())
    }

    fn run(&mut self, query: &Query, ctx: &RunContext) -> Result<()> {
        let channels = query.unique_channels();
        let size_buffer = query
            .option_u64("size_buffer")
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_SIZE_BUFFER);
        let block = query
            .option_f64("receive_timeout")
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_RECEIVE_TIMEOUT);

        let mut align = AlignmentBuffer::new(channels.iter().cloned())
            .with_partial(query.option_bool("partial_msg").unwrap_or(true))
            .with_size_buffer(size_buffer)
            .with_range(ctx.shared_range());
        if let Some(filter) = Self::compile_filter(query)? {
            align = align.with_filter(filter);
        }

        self.client.subscribe(&channels)?;
        info!(
            "Consuming {} stream(s) from {}",
            channels.len(),
            self.client.describe()
        );

        let max = ENTRIES_PER_CHANNEL * channels.len().max(1);
        let result = self.consume(&mut align, ctx, max, block);
        if !ctx.is_aborted() {
            Self::deliver(ctx, align.flush_all());
        }

        if let Err(e) = self.client.unsubscribe() {
            warn!("Error leaving bus streams: {}", e);
        }
        debug!("Alignment: {:?}", align.stats());
        result
    }

    fn search(&mut self, pattern: &str) -> Result<Vec<CatalogEntry>> {
        self.client.search(pattern)
    }
}
