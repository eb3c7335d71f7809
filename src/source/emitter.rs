//! Channel bookkeeping and event normalization
//!
//! [`ChannelEmitter`] is the single entry point adapters use to emit samples.
//! It turns raw `(name, value, timestamp, id)` arrivals into the ordered
//! `header → record* → completed` stream per channel, applying prefixing,
//! downsampling, signature tracking and decompression on the way.
//!
//! All calls on one emitter (and all its clones) are serialized by a single
//! lock, so per-channel worker threads can share it and every listener still
//! sees a deterministic order per channel. Listeners must not call back into
//! the emitter from their callbacks.

use super::listener::{fan_out, ChannelHeader, Listener, SourceInfo};
use crate::compression::Decompressor;
use crate::error::DataHubError;
use crate::range::TimeRange;
use crate::types::{
    now_nanos, ByteOrder, Compression, Metadata, Signature, TimeType, Timestamp, Value,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-sample options of [`ChannelEmitter::receive_channel`]
#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    /// Re-announce the channel when its (type, shape) signature changes
    pub check_changes: bool,
    /// Drop structurally invalid values (array length vs shape)
    pub check_types: bool,
    /// Extra metadata for the header (used when the header is emitted)
    pub metadata: Option<Metadata>,
}

impl ReceiveOptions {
    pub fn checked() -> Self {
        Self {
            check_changes: true,
            ..Default::default()
        }
    }
}

/// Downsampling parameters resolved at `request()`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Downsample {
    /// Minimum spacing between delivered records, in nanoseconds
    pub interval: Option<i64>,
    /// Deliver every Nth record
    pub modulo: Option<u64>,
}

impl Downsample {
    pub fn is_active(&self) -> bool {
        self.interval.is_some() || self.modulo.is_some()
    }
}

/// State of one open channel
#[derive(Debug)]
struct ChannelState {
    signature: Signature,
    /// Downsampling gate: timestamp of the last delivered record
    last_delivery: Option<Timestamp>,
    /// Downsampling gate: number of records seen since the channel opened
    index: u64,
}

impl ChannelState {
    fn open(signature: Signature) -> Self {
        Self {
            signature,
            last_delivery: None,
            index: 0,
        }
    }

    /// Apply the downsampling gate; true when the record passes.
    ///
    /// `modulo` keeps every n-th record counted from the first one seen on
    /// the channel and takes precedence over `interval`. The interval gate
    /// compares record timestamps, not arrival times: a record passes when
    /// its timestamp is at least `interval` after the last delivered one.
    /// Replayed archives and buffered bursts therefore thin out by data
    /// time, and a live stream behaves like a wall-clock gate as long as
    /// timestamps track arrival.
    fn admit(&mut self, downsample: &Downsample, timestamp: Timestamp) -> bool {
        let index = self.index;
        self.index += 1;

        if let Some(modulo) = downsample.modulo {
            if index % modulo != 0 {
                return false;
            }
        } else if let Some(interval) = downsample.interval {
            if let Some(last) = self.last_delivery {
                if timestamp - last < interval {
                    return false;
                }
            }
        }
        self.last_delivery = Some(timestamp);
        true
    }
}

/// Configuration captured when a query starts
pub(crate) struct EmitterConfig {
    pub info: Arc<SourceInfo>,
    pub listeners: Vec<Arc<dyn Listener>>,
    pub prefix: String,
    pub downsample: Downsample,
    pub time_type: TimeType,
    pub auto_decompress: bool,
    pub decompressor: Arc<dyn Decompressor>,
    pub range: Arc<TimeRange>,
}

struct EmitterShared {
    config: EmitterConfig,
    channels: Mutex<BTreeMap<String, ChannelState>>,
}

/// Serialized per-query channel event producer; cheap to clone
#[derive(Clone)]
pub struct ChannelEmitter {
    shared: Arc<EmitterShared>,
}

impl ChannelEmitter {
    pub(crate) fn new(config: EmitterConfig) -> Self {
        Self {
            shared: Arc::new(EmitterShared {
                config,
                channels: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Identity of the emitting source
    pub fn info(&self) -> &SourceInfo {
        &self.shared.config.info
    }

    /// Prefix applied to every channel name
    pub fn prefix(&self) -> &str {
        &self.shared.config.prefix
    }

    pub fn downsample(&self) -> Downsample {
        self.shared.config.downsample
    }

    /// Names (prefixed) of the currently open channels
    pub fn open_channels(&self) -> Vec<String> {
        self.shared.channels.lock().keys().cloned().collect()
    }

    fn prefixed(&self, name: &str) -> String {
        format!("{}{}", self.shared.config.prefix, name)
    }

    /// Emit one sample.
    ///
    /// `timestamp` is nanoseconds since the epoch; None uses the wall clock.
    /// Returns true when the record reached the listeners.
    pub fn receive_channel(
        &self,
        name: &str,
        value: Value,
        timestamp: Option<Timestamp>,
        id: Option<i64>,
        options: &ReceiveOptions,
    ) -> bool {
        let config = &self.shared.config;
        let name = self.prefixed(name);
        let timestamp = timestamp.unwrap_or_else(now_nanos);
        config.range.observe(timestamp, id);

        if options.check_types && !value.is_well_formed() {
            warn!("Dropping malformed value on channel {}", name);
            return false;
        }

        let mut channels = self.shared.channels.lock();
        let signature = value.signature();

        let open_signature = channels.get(&name).map(|state| state.signature.clone());
        let needs_header = match open_signature {
            None => true,
            Some(previous) if options.check_changes && previous != signature => {
                warn!(
                    "Channel {} changed format {} -> {}",
                    name, previous, signature
                );
                channels.remove(&name);
                fan_out(&config.listeners, "channel completed", |l| {
                    l.on_channel_completed(&config.info, &name)
                });
                true
            }
            Some(_) => false,
        };

        if needs_header {
            let header = self.header_for(&name, &value, &signature, id, options);
            fan_out(&config.listeners, "channel header", |l| {
                l.on_channel_header(&config.info, &header)
            });
            channels.insert(name.clone(), ChannelState::open(signature));
        }

        if config.downsample.is_active() {
            let admitted = channels
                .get_mut(&name)
                .map(|state| state.admit(&config.downsample, timestamp))
                .unwrap_or(true);
            if !admitted {
                return false;
            }
        }

        let value = match (config.auto_decompress, value) {
            (true, Value::Compressed(blob)) => match config.decompressor.decompress(
                &blob.data,
                blob.dtype,
                &blob.shape,
                &blob.compression,
            ) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("Dropping record on channel {}: {}", name, e);
                    return false;
                }
            },
            (_, value) => value,
        };

        let time = config.time_type.convert(timestamp);
        fan_out(&config.listeners, "channel record", |l| {
            l.on_channel_record(&config.info, &name, &time, id, &value)
        });
        true
    }

    fn header_for(
        &self,
        name: &str,
        value: &Value,
        signature: &Signature,
        id: Option<i64>,
        options: &ReceiveOptions,
    ) -> ChannelHeader {
        let mut metadata = options.metadata.clone().unwrap_or_default();
        metadata.insert("has_id".to_string(), serde_json::Value::Bool(id.is_some()));

        let compression: Option<Compression> = if self.shared.config.auto_decompress {
            None
        } else {
            value.compression().cloned()
        };

        ChannelHeader {
            name: name.to_string(),
            dtype: signature.dtype,
            byte_order: ByteOrder::Little,
            shape: signature.shape.clone(),
            compression,
            metadata,
        }
    }

    /// Complete one channel (adapter-side name, prefix is applied)
    pub fn close_channel(&self, name: &str) {
        let name = self.prefixed(name);
        let mut channels = self.shared.channels.lock();
        if channels.remove(&name).is_some() {
            let config = &self.shared.config;
            fan_out(&config.listeners, "channel completed", |l| {
                l.on_channel_completed(&config.info, &name)
            });
        }
    }

    /// Complete every open channel and clear all per-channel state
    pub fn close_channels(&self) {
        let mut channels = self.shared.channels.lock();
        let config = &self.shared.config;
        let names: Vec<String> = std::mem::take(&mut *channels).into_keys().collect();
        for name in names {
            debug!("Completing channel {}", name);
            fan_out(&config.listeners, "channel completed", |l| {
                l.on_channel_completed(&config.info, &name)
            });
        }
    }

    pub(crate) fn notify_start(&self) {
        let _guard = self.shared.channels.lock();
        let config = &self.shared.config;
        fan_out(&config.listeners, "start", |l| l.on_start(&config.info));
    }

    pub(crate) fn notify_stop(&self, error: Option<&DataHubError>) {
        let _guard = self.shared.channels.lock();
        let config = &self.shared.config;
        fan_out(&config.listeners, "stop", |l| l.on_stop(&config.info, error));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::compression::{compress_lz4, BuiltinDecompressor};
    use crate::error::Result;
    use crate::types::{ArrayValue, CompressedValue, DataType, RecordTime};
    use proptest::prelude::*;

    /// Listener recording events as compact strings
    #[derive(Default)]
    pub(crate) struct EventLog {
        pub events: Mutex<Vec<String>>,
        pub headers: Mutex<Vec<ChannelHeader>>,
        pub times: Mutex<Vec<RecordTime>>,
    }

    impl EventLog {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl Listener for EventLog {
        fn on_channel_header(&self, _: &SourceInfo, header: &ChannelHeader) -> Result<()> {
            self.events.lock().push(format!("header:{}", header.name));
            self.headers.lock().push(header.clone());
            Ok(())
        }

        fn on_channel_record(
            &self,
            _: &SourceInfo,
            name: &str,
            timestamp: &RecordTime,
            id: Option<i64>,
            value: &Value,
        ) -> Result<()> {
            self.events
                .lock()
                .push(format!("record:{}:{}:{}", name, id.unwrap_or(-1), value));
            self.times.lock().push(timestamp.clone());
            Ok(())
        }

        fn on_channel_completed(&self, _: &SourceInfo, name: &str) -> Result<()> {
            self.events.lock().push(format!("completed:{}", name));
            Ok(())
        }
    }

    fn info() -> Arc<SourceInfo> {
        Arc::new(SourceInfo {
            type_name: "test".into(),
            name: "test".into(),
            id: "test_0".into(),
            query_id: "test_0".into(),
            path: None,
            description: "test_0".into(),
        })
    }

    pub(crate) fn emitter_with(
        log: Arc<EventLog>,
        prefix: &str,
        downsample: Downsample,
        auto_decompress: bool,
    ) -> ChannelEmitter {
        ChannelEmitter::new(EmitterConfig {
            info: info(),
            listeners: vec![log],
            prefix: prefix.to_string(),
            downsample,
            time_type: TimeType::Nano,
            auto_decompress,
            decompressor: Arc::new(BuiltinDecompressor),
            range: Arc::new(TimeRange::unbounded()),
        })
    }

    #[test]
    fn test_header_record_completed_order() {
        let log = Arc::new(EventLog::default());
        let emitter = emitter_with(log.clone(), "", Downsample::default(), false);
        let opts = ReceiveOptions::default();

        emitter.receive_channel("A", Value::Float(1.0), Some(10), Some(1), &opts);
        emitter.receive_channel("A", Value::Float(2.0), Some(20), Some(2), &opts);
        emitter.close_channels();
        emitter.close_channels();

        assert_eq!(
            log.events(),
            vec!["header:A", "record:A:1:1", "record:A:2:2", "completed:A"]
        );
    }

    #[test]
    fn test_signature_change_reopens_channel() {
        let log = Arc::new(EventLog::default());
        let emitter = emitter_with(log.clone(), "", Downsample::default(), false);

        let checked = ReceiveOptions::checked();
        emitter.receive_channel("A", Value::Float(1.0), Some(1), None, &checked);
        emitter.receive_channel(
            "A",
            Value::Array(ArrayValue::from_f64(vec![1.0, 2.0])),
            Some(2),
            None,
            &checked,
        );
        emitter.close_channel("A");

        let events = log.events();
        assert_eq!(events[0], "header:A");
        assert_eq!(events[2], "completed:A");
        assert_eq!(events[3], "header:A");
        assert_eq!(events.last().map(String::as_str), Some("completed:A"));
        assert_eq!(log.headers.lock()[1].shape, vec![2]);
    }

    #[test]
    fn test_signature_change_ignored_without_check() {
        let log = Arc::new(EventLog::default());
        let emitter = emitter_with(log.clone(), "", Downsample::default(), false);
        let opts = ReceiveOptions::default();

        emitter.receive_channel("A", Value::Float(1.0), Some(1), None, &opts);
        emitter.receive_channel("A", Value::Int(2), Some(2), None, &opts);

        let headers = log.events().iter().filter(|e| e.starts_with("header")).count();
        assert_eq!(headers, 1);
    }

    #[test]
    fn test_prefix_and_has_id_metadata() {
        let log = Arc::new(EventLog::default());
        let emitter = emitter_with(log.clone(), "redis_0:", Downsample::default(), false);

        emitter.receive_channel("X", Value::Int(1), None, None, &ReceiveOptions::default());
        emitter.close_channel("X");

        assert_eq!(log.events()[0], "header:redis_0:X");
        assert_eq!(log.events()[2], "completed:redis_0:X");
        let header = &log.headers.lock()[0];
        assert_eq!(header.metadata.get("has_id"), Some(&serde_json::Value::Bool(false)));
    }

    #[test]
    fn test_check_types_drops_malformed() {
        let log = Arc::new(EventLog::default());
        let emitter = emitter_with(log.clone(), "", Downsample::default(), false);
        let bad = Value::Array(ArrayValue {
            dtype: DataType::F64,
            shape: vec![3],
            data: crate::types::ArrayData::Float(vec![1.0]),
        });
        let opts = ReceiveOptions {
            check_types: true,
            ..Default::default()
        };
        assert!(!emitter.receive_channel("A", bad, None, None, &opts));
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_auto_decompress() {
        let raw: Vec<u8> = [1.0f64, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let blob = Value::Compressed(CompressedValue {
            dtype: DataType::F64,
            shape: vec![2],
            compression: Compression::Lz4,
            data: compress_lz4(&raw),
        });

        let log = Arc::new(EventLog::default());
        let emitter = emitter_with(log.clone(), "", Downsample::default(), true);
        assert!(emitter.receive_channel("img", blob.clone(), Some(1), None, &Default::default()));
        assert_eq!(log.headers.lock()[0].compression, None);
        assert_eq!(log.events()[1], "record:img:-1:[1, 2]");

        let raw_log = Arc::new(EventLog::default());
        let passthrough = emitter_with(raw_log.clone(), "", Downsample::default(), false);
        passthrough.receive_channel("img", blob, Some(1), None, &Default::default());
        assert_eq!(raw_log.headers.lock()[0].compression, Some(Compression::Lz4));
    }

    #[test]
    fn test_modulo_delivers_every_nth() {
        let log = Arc::new(EventLog::default());
        let downsample = Downsample {
            interval: None,
            modulo: Some(3),
        };
        let emitter = emitter_with(log.clone(), "", downsample, false);
        let delivered: Vec<i64> = (0..10)
            .filter(|i| {
                emitter.receive_channel("A", Value::Int(*i), Some(*i), Some(*i), &Default::default())
            })
            .collect();
        assert_eq!(delivered, vec![0, 3, 6, 9]);
    }

    #[test]
    fn test_interval_follows_record_time() {
        let log = Arc::new(EventLog::default());
        let downsample = Downsample {
            interval: Some(10),
            modulo: None,
        };
        let emitter = emitter_with(log.clone(), "", downsample, false);

        // A replayed burst arrives at once but spans 40 units of data time
        let delivered: Vec<i64> = [0, 10, 15, 20, 29, 30, 40]
            .into_iter()
            .filter(|ts| {
                emitter.receive_channel("A", Value::Int(*ts), Some(*ts), None, &Default::default())
            })
            .collect();
        assert_eq!(delivered, vec![0, 10, 20, 30, 40]);
    }

    proptest! {
        #[test]
        fn prop_modulo_count(k in 0usize..200, n in 1u64..20) {
            let log = Arc::new(EventLog::default());
            let downsample = Downsample { interval: None, modulo: Some(n) };
            let emitter = emitter_with(log.clone(), "", downsample, false);
            let mut delivered = 0usize;
            for i in 0..k {
                if emitter.receive_channel("A", Value::Int(i as i64), Some(i as i64), None, &Default::default()) {
                    delivered += 1;
                }
            }
            prop_assert_eq!(delivered, k.div_ceil(n as usize));
        }

        #[test]
        fn prop_interval_spacing(gaps in prop::collection::vec(0i64..50, 1..100), interval in 1i64..100) {
            let log = Arc::new(EventLog::default());
            let downsample = Downsample { interval: Some(interval), modulo: None };
            let emitter = emitter_with(log.clone(), "", downsample, false);

            let mut ts = 1_000i64;
            let mut delivered = Vec::new();
            for gap in gaps {
                ts += gap;
                if emitter.receive_channel("A", Value::Int(0), Some(ts), None, &Default::default()) {
                    delivered.push(ts);
                }
            }
            prop_assert!(!delivered.is_empty());
            for pair in delivered.windows(2) {
                prop_assert!(pair[1] - pair[0] >= interval);
            }
        }
    }
}
