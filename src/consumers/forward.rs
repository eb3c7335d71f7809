//! Channel-forwarding consumer
//!
//! [`EventForwarder`] turns listener callbacks into [`SourceEvent`] messages
//! on a bounded crossbeam channel, so a consumer thread can process them at
//! its own pace. Records use `try_send`: when the queue is full the record
//! is dropped and counted. Control events (start, header, completed, stop)
//! wait up to [`CONTROL_SEND_TIMEOUT`] for room.

use crate::error::{DataHubError, Result};
use crate::source::{ChannelHeader, Listener, SourceInfo};
use crate::types::{RecordTime, Value};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Maximum wait for room on the queue for non-record events
pub const CONTROL_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// One forwarded listener callback; `source` is the emitting source id
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Start {
        source: String,
    },
    Header {
        source: String,
        header: ChannelHeader,
    },
    Record {
        source: String,
        channel: String,
        time: RecordTime,
        id: Option<i64>,
        value: Value,
    },
    Completed {
        source: String,
        channel: String,
    },
    Stop {
        source: String,
        error: Option<String>,
    },
}

impl SourceEvent {
    pub fn source(&self) -> &str {
        match self {
            SourceEvent::Start { source }
            | SourceEvent::Header { source, .. }
            | SourceEvent::Record { source, .. }
            | SourceEvent::Completed { source, .. }
            | SourceEvent::Stop { source, .. } => source,
        }
    }
}

/// Listener forwarding events over a bounded channel
pub struct EventForwarder {
    sender: Sender<SourceEvent>,
    dropped: AtomicU64,
}

impl EventForwarder {
    /// Forwarder plus the receiving end of its queue
    pub fn new(capacity: usize) -> (Self, Receiver<SourceEvent>) {
        let (sender, receiver) = bounded(capacity.max(1));
        (
            Self {
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    /// Events lost to a full queue
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send_record(&self, event: SourceEvent) -> Result<()> {
        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(disconnected()),
        }
    }

    fn send_control(&self, event: SourceEvent) -> Result<()> {
        match self.sender.send_timeout(event, CONTROL_SEND_TIMEOUT) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(event)) => {
                warn!("Event queue full, dropping {:?} event", kind(&event));
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(disconnected()),
        }
    }
}

fn disconnected() -> DataHubError {
    DataHubError::Backend("event receiver disconnected".into())
}

fn kind(event: &SourceEvent) -> &'static str {
    match event {
        SourceEvent::Start { .. } => "start",
        SourceEvent::Header { .. } => "header",
        SourceEvent::Record { .. } => "record",
        SourceEvent::Completed { .. } => "completed",
        SourceEvent::Stop { .. } => "stop",
    }
}

impl Listener for EventForwarder {
    fn on_start(&self, source: &SourceInfo) -> Result<()> {
        self.send_control(SourceEvent::Start {
            source: source.id.clone(),
        })
    }

    fn on_channel_header(&self, source: &SourceInfo, header: &ChannelHeader) -> Result<()> {
        self.send_control(SourceEvent::Header {
            source: source.id.clone(),
            header: header.clone(),
        })
    }

    fn on_channel_record(
        &self,
        source: &SourceInfo,
        name: &str,
        timestamp: &RecordTime,
        id: Option<i64>,
        value: &Value,
    ) -> Result<()> {
        self.send_record(SourceEvent::Record {
            source: source.id.clone(),
            channel: name.to_string(),
            time: timestamp.clone(),
            id,
            value: value.clone(),
        })
    }

    fn on_channel_completed(&self, source: &SourceInfo, name: &str) -> Result<()> {
        self.send_control(SourceEvent::Completed {
            source: source.id.clone(),
            channel: name.to_string(),
        })
    }

    fn on_stop(&self, source: &SourceInfo, error: Option<&DataHubError>) -> Result<()> {
        self.send_control(SourceEvent::Stop {
            source: source.id.clone(),
            error: error.map(|e| e.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SourceInfo {
        SourceInfo {
            type_name: "test".into(),
            name: "test".into(),
            id: "test_0".into(),
            query_id: "test_0".into(),
            path: None,
            description: "test_0".into(),
        }
    }

    fn record(forwarder: &EventForwarder, id: i64) -> Result<()> {
        forwarder.on_channel_record(&info(), "A", &RecordTime::Nanos(id), Some(id), &Value::Int(id))
    }

    #[test]
    fn test_forwards_in_order() {
        let (forwarder, rx) = EventForwarder::new(16);
        forwarder.on_start(&info()).unwrap();
        record(&forwarder, 1).unwrap();
        forwarder.on_channel_completed(&info(), "A").unwrap();
        forwarder.on_stop(&info(), None).unwrap();

        let events: Vec<SourceEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[1], SourceEvent::Record { id: Some(1), .. }));
        assert_eq!(
            events[3],
            SourceEvent::Stop {
                source: "test_0".into(),
                error: None
            }
        );
        assert!(events.iter().all(|e| e.source() == "test_0"));
    }

    #[test]
    fn test_full_queue_drops_records() {
        let (forwarder, rx) = EventForwarder::new(2);
        for id in 0..5 {
            record(&forwarder, id).unwrap();
        }
        assert_eq!(forwarder.dropped(), 3);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_disconnected_receiver_is_error() {
        let (forwarder, rx) = EventForwarder::new(2);
        drop(rx);
        assert!(record(&forwarder, 1).is_err());
    }
}
