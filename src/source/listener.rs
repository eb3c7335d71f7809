//! Listener (consumer) contract
//!
//! A [`Listener`] receives the normalized event stream of a source:
//!
//! ```text
//! on_start
//!   on_channel_header(c) on_channel_record(c)* on_channel_completed(c)   (per channel)
//! on_stop(error)
//! ```
//!
//! Callbacks for one event run synchronously, in registration order, before
//! the source proceeds. Errors and panics raised by a listener are logged
//! and never reach the source or the other listeners.

use crate::error::{DataHubError, Result};
use crate::types::{ByteOrder, Compression, DataType, Metadata, RecordTime, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

/// Identity of the source emitting an event
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    /// Adapter type name ("daqbuf", "bus", ...)
    pub type_name: String,
    /// Display name
    pub name: String,
    /// Query id (`"{type}_{counter}"`) or the user override
    pub id: String,
    /// Generated query id
    pub query_id: String,
    /// Optional output path hint for file consumers
    pub path: Option<PathBuf>,
    /// `"<id>[<target>]"`
    pub description: String,
}

/// Format announcement preceding the records of a channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelHeader {
    pub name: String,
    pub dtype: DataType,
    pub byte_order: ByteOrder,
    /// Empty for scalars
    pub shape: Vec<usize>,
    /// Codec of delivered values; None when values arrive decompressed
    pub compression: Option<Compression>,
    pub metadata: Metadata,
}

/// Sink interface called by a running source
pub trait Listener: Send + Sync {
    fn on_start(&self, _source: &SourceInfo) -> Result<()> {
        Ok(())
    }

    fn on_channel_header(&self, source: &SourceInfo, header: &ChannelHeader) -> Result<()>;

    fn on_channel_record(
        &self,
        source: &SourceInfo,
        name: &str,
        timestamp: &RecordTime,
        id: Option<i64>,
        value: &Value,
    ) -> Result<()>;

    fn on_channel_completed(&self, source: &SourceInfo, name: &str) -> Result<()>;

    /// `error` is None for normal completion and for aborted queries
    fn on_stop(&self, _source: &SourceInfo, _error: Option<&DataHubError>) -> Result<()> {
        Ok(())
    }

    /// Release resources held by the listener (files, plots)
    fn close(&self) {}
}

/// Invoke `f` on every listener in order, logging and swallowing failures
pub(crate) fn fan_out<F>(listeners: &[Arc<dyn Listener>], event: &str, f: F)
where
    F: Fn(&dyn Listener) -> Result<()>,
{
    for (index, listener) in listeners.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Listener {} failed on {}: {}", index, event, e);
            }
            Err(_) => {
                tracing::error!("Listener {} panicked on {}", index, event);
            }
        }
    }
}
