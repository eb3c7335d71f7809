//! Archival retrieval over length-framed streams
//!
//! The archive answers one request per channel with a framed byte stream
//! (see [`crate::protocol`]). Retrieval starts only once the requested range
//! is in the past: the adapter waits for `end + delay` before opening any
//! stream.
//!
//! The transport is a [`FrameStreamProvider`]. [`DirectoryProvider`] replays
//! captured streams from `<dir>/<channel>.frames`; HTTP clients plug in by
//! implementing the same trait.

use crate::config::{Query, RangeMode};
use crate::error::{DataHubError, Result, ResultExt};
use crate::protocol::{decode_channel_stream, StreamEnd};
use crate::range::TimeRange;
use crate::source::{Adapter, CatalogEntry, ReceiveOptions, RunContext};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

pub const TYPE_NAME: &str = "daqbuf";

/// Backends listed by an empty search
pub const KNOWN_BACKENDS: &[&str] = &["sf-databuffer"];

/// Extension of captured channel streams
pub const CAPTURE_EXTENSION: &str = "frames";

const FALLBACK_URL: &str = "https://data-api.psi.ch/api/4";
const FALLBACK_BACKEND: &str = "sf-databuffer";

/// Service URL, overridable through `DAQBUF_DEFAULT_URL`
pub fn default_url() -> String {
    std::env::var("DAQBUF_DEFAULT_URL").unwrap_or_else(|_| FALLBACK_URL.to_string())
}

/// Backend name, overridable through `DAQBUF_DEFAULT_BACKEND`
pub fn default_backend() -> String {
    std::env::var("DAQBUF_DEFAULT_BACKEND").unwrap_or_else(|_| FALLBACK_BACKEND.to_string())
}

fn default_delay() -> f64 {
    1.0
}

/// Options of the `daqbuf` source type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqbufOptions {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_backend")]
    pub backend: String,

    /// Seconds to wait past the range end before retrieving
    #[serde(default = "default_delay")]
    pub delay: f64,

    /// One worker thread per channel
    #[serde(default)]
    pub parallel: bool,

    /// Replay captured streams from this directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for DaqbufOptions {
    fn default() -> Self {
        Self {
            url: default_url(),
            backend: default_backend(),
            delay: default_delay(),
            parallel: false,
            directory: None,
        }
    }
}

/// Parameters of one channel retrieval
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRequest {
    pub channel: String,
    pub backend: String,
    pub mode: RangeMode,
    /// Resolved bounds: nanoseconds in time mode, ids in id mode
    pub start: Option<i64>,
    pub end: Option<i64>,
    /// ISO-8601 bounds, time mode only
    pub begin_date: Option<String>,
    pub end_date: Option<String>,
}

impl ArchiveRequest {
    pub fn new(channel: &str, backend: &str, range: &TimeRange) -> Self {
        Self {
            channel: channel.to_string(),
            backend: backend.to_string(),
            mode: range.mode(),
            start: range.start(),
            end: range.end(),
            begin_date: range.start_str(),
            end_date: range.end_str(),
        }
    }
}

/// Transport delivering one framed byte stream per channel
pub trait FrameStreamProvider: Send + Sync {
    /// Open the stream answering `request`
    fn open(&self, request: &ArchiveRequest) -> Result<Box<dyn Read + Send>>;

    /// Channels matching `pattern` on `backend`
    fn search(&self, _pattern: &str, _backend: &str) -> Result<Vec<CatalogEntry>> {
        Err(DataHubError::Unsupported(
            "channel search is not available on this transport".into(),
        ))
    }

    /// Human-readable target, used in source descriptions
    fn describe(&self) -> String;
}

// ==================== Directory Provider ====================

/// Replays streams captured as `<dir>/<channel>.frames`
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    directory: PathBuf,
}

impl DirectoryProvider {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Capture file of a channel
    pub fn capture_path(&self, channel: &str) -> PathBuf {
        self.directory
            .join(format!("{}.{}", channel, CAPTURE_EXTENSION))
    }
}

impl FrameStreamProvider for DirectoryProvider {
    fn open(&self, request: &ArchiveRequest) -> Result<Box<dyn Read + Send>> {
        let path = self.capture_path(&request.channel);
        let file = File::open(&path).map_err(|e| {
            DataHubError::Backend(format!("Unable to open capture {:?}: {}", path, e))
        })?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn search(&self, pattern: &str, backend: &str) -> Result<Vec<CatalogEntry>> {
        let entries = std::fs::read_dir(&self.directory).map_err(|e| {
            DataHubError::Backend(format!("Unable to list {:?}: {}", self.directory, e))
        })?;

        let mut found = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CAPTURE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if stem.contains(pattern) {
                    let mut item = CatalogEntry::named(stem);
                    item.backend = Some(backend.to_string());
                    found.push(item);
                }
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    fn describe(&self) -> String {
        self.directory.display().to_string()
    }
}

// ==================== Adapter ====================

/// Archive source reading one framed stream per channel
pub struct DaqbufAdapter {
    options: DaqbufOptions,
    provider: Box<dyn FrameStreamProvider>,
}

impl DaqbufAdapter {
    pub fn new(options: DaqbufOptions, provider: Box<dyn FrameStreamProvider>) -> Self {
        Self { options, provider }
    }

    /// Build from task options; only directory replay is built in
    pub fn from_options(options: DaqbufOptions) -> Result<Self> {
        match options.directory.clone() {
            Some(directory) => Ok(Self::new(options, Box::new(DirectoryProvider::new(directory)))),
            None => Err(DataHubError::Config(format!(
                "daqbuf source for {} needs a stream provider or a capture `directory`",
                options.url
            ))),
        }
    }

    pub fn options(&self) -> &DaqbufOptions {
        &self.options
    }

    fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.options.delay.max(0.0)).unwrap_or(Duration::ZERO)
    }

    /// Retrieve and decode one channel; emits its completion if anything arrived
    fn run_channel(&self, channel: &str, ctx: &RunContext) -> Result<()> {
        let request = ArchiveRequest::new(channel, &self.options.backend, ctx.range());
        debug!(
            "Retrieving {} [{} .. {}]",
            channel,
            request.begin_date.as_deref().unwrap_or("-"),
            request.end_date.as_deref().unwrap_or("-")
        );
        let stream = self
            .provider
            .open(&request)
            .with_context(|| format!("Channel {}", channel))?;

        let options = ReceiveOptions {
            check_changes: false,
            check_types: true,
            metadata: None,
        };
        let mut received = 0usize;
        let outcome = decode_channel_stream(stream, ctx.cancel(), |sample| {
            ctx.receive_with(
                channel,
                sample.value,
                Some(sample.timestamp),
                Some(sample.id),
                &options,
            );
            received += 1;
        });

        if received > 0 {
            ctx.close_channel(channel);
        }

        match outcome {
            Ok(StreamEnd::RangeFinal) => {
                debug!("Channel {}: {} samples, range final", channel, received);
                Ok(())
            }
            Ok(StreamEnd::Eof) => {
                debug!("Channel {}: {} samples, end of stream", channel, received);
                Ok(())
            }
            Err(e) => {
                if e.is_protocol_error() {
                    error!("Channel {}: unexpected end of input", channel);
                }
                Err(e.with_context(format!("Channel {}", channel)))
            }
        }
    }

    fn run_parallel(&self, channels: &[String], ctx: &RunContext) -> Result<()> {
        let outcomes: Vec<(String, Result<()>)> = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(channels.len());
            for channel in channels {
                let spawned = std::thread::Builder::new()
                    .name(format!("{}-{}", ctx.query_id(), channel))
                    .spawn_scoped(scope, move || self.run_channel(channel, ctx));
                handles.push((channel.clone(), spawned));
            }

            handles
                .into_iter()
                .map(|(channel, spawned)| {
                    let outcome = match spawned {
                        Ok(handle) => handle.join().unwrap_or_else(|_| {
                            Err(DataHubError::Backend(format!("worker for {} panicked", channel)))
                        }),
                        Err(e) => Err(DataHubError::Io(e)),
                    };
                    (channel, outcome)
                })
                .collect()
        });

        let mut failures = Vec::new();
        let mut aborted = false;
        for (channel, outcome) in outcomes {
            match outcome {
                Ok(()) => {}
                Err(e) if e.is_aborted() => aborted = true,
                Err(e) => {
                    error!("Channel {} failed: {}", channel, e);
                    failures.push(e.to_string());
                }
            }
        }

        if !failures.is_empty() {
            return Err(DataHubError::Backend(format!(
                "{} of {} channels failed: {}",
                failures.len(),
                channels.len(),
                failures.join("; ")
            )));
        }
        if aborted {
            return Err(DataHubError::Aborted);
        }
        Ok(())
    }
}

impl Adapter for DaqbufAdapter {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn target(&self) -> Option<String> {
        Some(self.options.backend.clone())
    }

    fn validate(&self, query: &Query) -> Result<()> {
        if query.channels.is_empty() {
            return Err(DataHubError::Config("no channels requested".into()));
        }
        // negative delays clamp to zero
        let delay = self.options.delay;
        if delay.is_nan() || Duration::try_from_secs_f64(delay.max(0.0)).is_err() {
            return Err(DataHubError::Config(format!("Invalid delay: {}", delay)));
        }
        Ok(())
    }

    fn run(&mut self, query: &Query, ctx: &RunContext) -> Result<()> {
        ctx.range().wait_end(self.delay(), ctx.cancel())?;

        let channels = query.unique_channels();
        info!(
            "Reading {} channel(s) from {} ({})",
            channels.len(),
            self.provider.describe(),
            if self.options.parallel { "parallel" } else { "sequential" }
        );

        if self.options.parallel {
            self.run_parallel(&channels, ctx)
        } else {
            for channel in &channels {
                self.run_channel(channel, ctx)?;
            }
            Ok(())
        }
    }

    fn search(&mut self, pattern: &str) -> Result<Vec<CatalogEntry>> {
        if pattern.is_empty() {
            return Ok(KNOWN_BACKENDS
                .iter()
                .map(|backend| {
                    let mut entry = CatalogEntry::named(*backend);
                    entry.description = Some("backend".into());
                    entry
                })
                .collect());
        }
        self.provider.search(pattern, &self.options.backend)
    }
}
