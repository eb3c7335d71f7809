//! Source lifecycle
//!
//! A [`Source`] owns the lifecycle of one query at a time: it resolves the
//! query's range, downsampling and prefix, runs the adapter (synchronously or
//! on a named background thread), and fans the normalized channel events out
//! to its listeners.
//!
//! # Architecture
//!
//! ```text
//! request(query) ──► Adapter::run(query, ctx) ──► ctx.receive(...) ──► ChannelEmitter
//!                                                                        │
//!                                  header / record / completed ◄─────────┘
//!                                                │
//!                                   Listener 1 … Listener N (in order)
//! ```
//!
//! # State machine
//!
//! `Idle → Running → {Completed | Failed | Aborted}`; a source can be
//! requested again from any terminal state. `Aborted` is only reached through
//! cooperative polling of the [`CancelToken`] inside the adapter.

pub mod cancel;
pub mod emitter;
pub mod listener;
pub mod runtime;

pub use cancel::CancelToken;
pub use emitter::{ChannelEmitter, Downsample, ReceiveOptions};
pub use listener::{ChannelHeader, Listener, SourceInfo};
pub use runtime::SourceRuntime;

use crate::compression::{BuiltinDecompressor, Decompressor};
use crate::config::{BoundSpec, Query};
use crate::error::{DataHubError, Result};
use crate::range::TimeRange;
use crate::types::{TimeType, Timestamp, Value};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use emitter::EmitterConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ==================== Adapter Contract ====================

/// One entry of a catalog search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub dtype: Option<String>,
    #[serde(default)]
    pub shape: Vec<usize>,
    #[serde(default)]
    pub description: Option<String>,
}

impl CatalogEntry {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: None,
            dtype: None,
            shape: Vec::new(),
            description: None,
        }
    }
}

/// What every concrete source implements.
///
/// Constructors only resolve the connection target; nothing touches the
/// network before [`Adapter::run`].
pub trait Adapter: Send {
    /// Type name used for query ids (`"{type}_{n}"`)
    fn type_name(&self) -> &'static str;

    /// Connection target shown in the description (URL, backend)
    fn target(&self) -> Option<String> {
        None
    }

    /// Adapter-specific query checks, run at `request()` time
    fn validate(&self, _query: &Query) -> Result<()> {
        Ok(())
    }

    /// Retrieval loop; emits every sample through `ctx` and polls
    /// `ctx.cancel()` inside every unbounded loop
    fn run(&mut self, query: &Query, ctx: &RunContext) -> Result<()>;

    /// Catalog lookup
    fn search(&mut self, _pattern: &str) -> Result<Vec<CatalogEntry>> {
        Err(DataHubError::Unsupported(format!(
            "search is not supported by {}",
            self.type_name()
        )))
    }
}

/// Everything a running adapter needs from its source
pub struct RunContext {
    emitter: ChannelEmitter,
    range: Arc<TimeRange>,
    cancel: CancelToken,
}

impl RunContext {
    pub fn emitter(&self) -> &ChannelEmitter {
        &self.emitter
    }

    pub fn range(&self) -> &TimeRange {
        &self.range
    }

    /// The range handle, for helpers that outlive a borrow
    pub fn shared_range(&self) -> Arc<TimeRange> {
        self.range.clone()
    }

    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn query_id(&self) -> &str {
        &self.emitter.info().query_id
    }

    /// Emit one sample with default options
    pub fn receive(
        &self,
        name: &str,
        value: Value,
        timestamp: Option<Timestamp>,
        id: Option<i64>,
    ) -> bool {
        self.emitter
            .receive_channel(name, value, timestamp, id, &ReceiveOptions::default())
    }

    /// Emit one sample
    pub fn receive_with(
        &self,
        name: &str,
        value: Value,
        timestamp: Option<Timestamp>,
        id: Option<i64>,
        options: &ReceiveOptions,
    ) -> bool {
        self.emitter
            .receive_channel(name, value, timestamp, id, options)
    }

    pub fn close_channel(&self, name: &str) {
        self.emitter.close_channel(name);
    }

    pub fn close_channels(&self) {
        self.emitter.close_channels();
    }
}

// ==================== Source ====================

/// Source-level settings, independent of the query
#[derive(Debug, Clone, Default)]
pub struct SourceSettings {
    /// Display name; the source id when absent
    pub name: Option<String>,
    /// Representation of delivered timestamps
    pub time_type: TimeType,
    /// Decompress compressed channels before delivery
    pub auto_decompress: bool,
}

/// Lifecycle state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceState {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceState::Idle => write!(f, "Idle"),
            SourceState::Running => write!(f, "Running"),
            SourceState::Completed => write!(f, "Completed"),
            SourceState::Failed => write!(f, "Failed"),
            SourceState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Execution bookkeeping, guarded by one lock
#[derive(Default)]
struct ExecState {
    state: SourceState,
    query_id: Option<String>,
    cancel: CancelToken,
    emitter: Option<ChannelEmitter>,
    range: Option<Arc<TimeRange>>,
    /// Disconnects when the background thread finishes
    done: Option<Receiver<()>>,
    thread: Option<JoinHandle<()>>,
    /// Thread currently executing the adapter
    exec_thread: Option<ThreadId>,
    last_error: Option<String>,
}

/// Shared state behind a [`Source`] handle
pub struct SourceCore {
    key: u64,
    type_name: &'static str,
    target: Option<String>,
    settings: SourceSettings,
    runtime: Arc<SourceRuntime>,
    adapter: Mutex<Box<dyn Adapter>>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    decompressor: Mutex<Arc<dyn Decompressor>>,
    user_id: Mutex<Option<String>>,
    path: Mutex<Option<PathBuf>>,
    exec: Mutex<ExecState>,
}

/// Handle to a data source; dropping it closes the source
pub struct Source {
    core: Arc<SourceCore>,
}

impl Source {
    /// Create a source around an adapter and register it with the runtime
    pub fn new(
        runtime: &Arc<SourceRuntime>,
        adapter: Box<dyn Adapter>,
        settings: SourceSettings,
    ) -> Self {
        let core = Arc::new(SourceCore {
            key: runtime.allocate_key(),
            type_name: adapter.type_name(),
            target: adapter.target(),
            settings,
            runtime: runtime.clone(),
            adapter: Mutex::new(adapter),
            listeners: Mutex::new(Vec::new()),
            decompressor: Mutex::new(Arc::new(BuiltinDecompressor)),
            user_id: Mutex::new(None),
            path: Mutex::new(None),
            exec: Mutex::new(ExecState::default()),
        });
        runtime.register(core.key, Arc::downgrade(&core));
        Self { core }
    }

    /// Replace the decompression collaborator used for `auto_decompress`
    pub fn with_decompressor(self, decompressor: Arc<dyn Decompressor>) -> Self {
        *self.core.decompressor.lock() = decompressor;
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.core.type_name
    }

    /// Configured name, else [`Source::id`]; also the label of prefix `true`
    pub fn name(&self) -> String {
        self.core.name()
    }

    /// User id override, else the current query id, else the type name
    pub fn id(&self) -> String {
        self.core.id()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        *self.core.user_id.lock() = Some(id.into());
    }

    /// Id of the most recent query
    pub fn query_id(&self) -> Option<String> {
        self.core.exec.lock().query_id.clone()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.core.path.lock().clone()
    }

    pub fn set_path(&self, path: impl Into<PathBuf>) {
        *self.core.path.lock() = Some(path.into());
    }

    /// `"<id>[<target>]"`
    pub fn description(&self) -> String {
        self.core.description()
    }

    /// Register a listener; takes effect at the next `request()`
    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.core.listeners.lock().push(listener);
    }

    /// Detach all listeners
    pub fn remove_listeners(&self) {
        self.core.listeners.lock().clear();
    }

    /// Close and detach all listeners
    pub fn close_listeners(&self) {
        self.core.close_listeners();
    }

    pub fn listener_count(&self) -> usize {
        self.core.listeners.lock().len()
    }

    /// Start a query.
    ///
    /// Fails with `OngoingQuery` while a previous query runs and with `Config`
    /// for invalid parameters. In background mode returns immediately;
    /// otherwise returns after completion with the run's error, if any
    /// (an aborted run returns `Ok`).
    pub fn request(&self, query: Query, background: bool) -> Result<()> {
        SourceCore::request(&self.core, query, background)
    }

    /// Convenience: request `channels` over `[start, end]`
    pub fn req<I, S>(
        &self,
        channels: I,
        start: Option<BoundSpec>,
        end: Option<BoundSpec>,
        background: bool,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request(Query::new(channels).with_range(start, end), background)
    }

    /// Wait for a background query; true when it finished (or none was running)
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        self.core.join(timeout)
    }

    /// Request cooperative cancellation of the running query
    pub fn abort(&self) {
        self.core.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.core.exec.lock().cancel.is_cancelled()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SourceState::Running
    }

    pub fn state(&self) -> SourceState {
        self.core.exec.lock().state
    }

    /// Error message of the last failed query
    pub fn last_error(&self) -> Option<String> {
        self.core.exec.lock().last_error.clone()
    }

    /// Range of the current (or last) query
    pub fn range(&self) -> Option<Arc<TimeRange>> {
        self.core.exec.lock().range.clone()
    }

    /// Catalog lookup; unavailable while a query runs
    pub fn search(&self, pattern: &str) -> Result<Vec<CatalogEntry>> {
        if self.is_running() {
            return Err(DataHubError::OngoingQuery);
        }
        self.core.adapter.lock().search(pattern)
    }

    /// Abort and join a running background query, complete open channels,
    /// detach listeners and deregister. Safe to call repeatedly.
    pub fn close(&self) {
        self.core.close();
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("description", &self.description())
            .field("state", &self.state())
            .finish()
    }
}

impl SourceCore {
    /// Configured name, else the id. Locks `exec`.
    fn name(&self) -> String {
        match &self.settings.name {
            Some(name) => name.clone(),
            None => self.id(),
        }
    }

    fn id(&self) -> String {
        if let Some(id) = self.user_id.lock().clone() {
            return id;
        }
        self.exec
            .lock()
            .query_id
            .clone()
            .unwrap_or_else(|| self.type_name.to_string())
    }

    fn description(&self) -> String {
        match &self.target {
            Some(target) => format!("{}[{}]", self.id(), target),
            None => self.id(),
        }
    }

    fn request(core: &Arc<SourceCore>, query: Query, background: bool) -> Result<()> {
        let (previous, ctx) = {
            let mut exec = core.exec.lock();
            if exec.state == SourceState::Running {
                return Err(DataHubError::OngoingQuery);
            }

            let downsample = Downsample {
                interval: match &query.interval {
                    Some(spec) => {
                        let secs = spec.resolve_interval()?;
                        (secs > 0.0).then(|| (secs * 1e9) as i64)
                    }
                    None => None,
                },
                modulo: query.modulo.as_ref().map(|m| m.resolve_modulo()).transpose()?,
            };
            let range = Arc::new(TimeRange::from_query(&query)?);
            core.adapter.lock().validate(&query)?;

            let query_id = core.runtime.next_query_id(core.type_name);
            exec.query_id = Some(query_id.clone());

            let id = core
                .user_id
                .lock()
                .clone()
                .unwrap_or_else(|| query_id.clone());
            // `name()` would relock exec
            let name = core.settings.name.clone().unwrap_or_else(|| id.clone());
            let prefix = query
                .prefix
                .as_ref()
                .map(|p| p.resolve(&name))
                .unwrap_or_default();

            let info = Arc::new(SourceInfo {
                type_name: core.type_name.to_string(),
                name,
                description: match &core.target {
                    Some(target) => format!("{}[{}]", id, target),
                    None => id.clone(),
                },
                id,
                query_id,
                path: core.path.lock().clone(),
            });

            let emitter = ChannelEmitter::new(EmitterConfig {
                info,
                listeners: core.listeners.lock().clone(),
                prefix,
                downsample,
                time_type: core.settings.time_type,
                auto_decompress: core.settings.auto_decompress,
                decompressor: core.decompressor.lock().clone(),
                range: range.clone(),
            });

            let cancel = CancelToken::new();
            exec.state = SourceState::Running;
            exec.cancel = cancel.clone();
            exec.emitter = Some(emitter.clone());
            exec.range = Some(range.clone());
            exec.last_error = None;

            let previous = exec.thread.take();
            exec.done = None;
            (
                previous,
                RunContext {
                    emitter,
                    range,
                    cancel,
                },
            )
        };

        // The previous background thread has already reached a terminal state
        if let Some(handle) = previous {
            let _ = handle.join();
        }
        core.runtime.register(core.key, Arc::downgrade(core));

        if !background {
            core.exec.lock().exec_thread = Some(std::thread::current().id());
            return SourceCore::execute(core, query, ctx);
        }

        let (done_tx, done_rx) = bounded::<()>(1);
        let thread_core = core.clone();
        let thread_name = format!("datahub-{}", ctx.query_id());
        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                thread_core.exec.lock().exec_thread = Some(std::thread::current().id());
                if let Err(e) = SourceCore::execute(&thread_core, query, ctx) {
                    error!("Background query failed: {}", e);
                }
                drop(done_tx);
            });

        let mut exec = core.exec.lock();
        match spawned {
            Ok(handle) => {
                exec.thread = Some(handle);
                exec.done = Some(done_rx);
                Ok(())
            }
            Err(e) => {
                exec.state = SourceState::Failed;
                exec.last_error = Some(e.to_string());
                Err(DataHubError::Io(e))
            }
        }
    }

    fn execute(core: &Arc<SourceCore>, query: Query, ctx: RunContext) -> Result<()> {
        info!(
            "Query {} started on {} channel(s)",
            ctx.query_id(),
            query.channels.len()
        );
        ctx.emitter.notify_start();

        let result = {
            let mut adapter = core.adapter.lock();
            match catch_unwind(AssertUnwindSafe(|| adapter.run(&query, &ctx))) {
                Ok(result) => result,
                Err(_) => Err(DataHubError::Backend(format!(
                    "{} adapter panicked",
                    core.type_name
                ))),
            }
        };

        ctx.emitter.close_channels();

        let (state, failure) = match result {
            Ok(()) => (SourceState::Completed, None),
            Err(e) if e.is_aborted() => (SourceState::Aborted, None),
            Err(e) => (SourceState::Failed, Some(e)),
        };
        ctx.emitter.notify_stop(failure.as_ref());

        {
            let mut exec = core.exec.lock();
            exec.state = state;
            exec.exec_thread = None;
            exec.last_error = failure.as_ref().map(|e| e.to_string());
        }

        match failure {
            Some(e) => {
                warn!("Query {} failed: {}", ctx.query_id(), e);
                Err(e)
            }
            None => {
                info!("Query {} finished: {}", ctx.query_id(), state);
                Ok(())
            }
        }
    }

    fn abort(&self) {
        let exec = self.exec.lock();
        if exec.state == SourceState::Running {
            info!(
                "Aborting query {}",
                exec.query_id.as_deref().unwrap_or(self.type_name)
            );
        }
        exec.cancel.cancel();
    }

    fn join(&self, timeout: Option<Duration>) -> bool {
        let done = {
            let exec = self.exec.lock();
            if exec.exec_thread == Some(std::thread::current().id()) {
                return false;
            }
            match &exec.done {
                Some(done) => done.clone(),
                None => return true,
            }
        };

        let finished = match timeout {
            Some(timeout) => !matches!(done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout)),
            None => {
                let _ = done.recv();
                true
            }
        };

        if finished {
            let handle = {
                let mut exec = self.exec.lock();
                exec.done = None;
                exec.thread.take()
            };
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
        finished
    }

    fn close_listeners(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.close())).is_err() {
                error!("Listener panicked on close");
            }
        }
    }

    /// Abort, wait for the execution thread and complete the open channels.
    ///
    /// On the execution thread itself (a listener closing its source) the
    /// emitter may be mid-delivery, so only the abort is raised here and
    /// `execute` completes the channels once the adapter unwinds.
    pub(crate) fn close(&self) {
        let (running, on_exec_thread, emitter) = {
            let exec = self.exec.lock();
            (
                exec.state == SourceState::Running,
                exec.exec_thread == Some(std::thread::current().id()),
                exec.emitter.clone(),
            )
        };

        if on_exec_thread {
            debug!("Close requested from the execution thread");
            self.abort();
        } else {
            if running {
                self.abort();
                self.join(None);
            }
            if let Some(emitter) = emitter {
                emitter.close_channels();
            }
        }
        self.listeners.lock().clear();
        self.runtime.deregister(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::emitter::tests::EventLog;
    use super::*;
    use crate::config::PrefixSpec;

    /// Emits `count` samples on each channel, optionally forever until aborted
    struct Scripted {
        count: i64,
        forever: bool,
        fail: bool,
    }

    impl Adapter for Scripted {
        fn type_name(&self) -> &'static str {
            "scripted"
        }

        fn target(&self) -> Option<String> {
            Some("memory".into())
        }

        fn run(&mut self, query: &Query, ctx: &RunContext) -> Result<()> {
            let mut i = 0;
            loop {
                ctx.cancel().check()?;
                for channel in &query.channels {
                    ctx.receive(channel, Value::Int(i), Some(i), Some(i));
                }
                i += 1;
                if !self.forever && i >= self.count {
                    break;
                }
                if self.forever {
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
            if self.fail {
                return Err(DataHubError::Backend("connection reset".into()));
            }
            Ok(())
        }
    }

    fn source(runtime: &Arc<SourceRuntime>, adapter: Scripted) -> (Source, Arc<EventLog>) {
        let source = Source::new(runtime, Box::new(adapter), SourceSettings::default());
        let log = Arc::new(EventLog::default());
        source.add_listener(log.clone());
        (source, log)
    }

    #[test]
    fn test_synchronous_request() {
        let runtime = SourceRuntime::new();
        let (source, log) = source(
            &runtime,
            Scripted {
                count: 2,
                forever: false,
                fail: false,
            },
        );

        source.request(Query::new(["A"]), false).unwrap();
        assert_eq!(source.state(), SourceState::Completed);
        assert_eq!(source.query_id().as_deref(), Some("scripted_0"));
        assert_eq!(
            log.events(),
            vec!["header:A", "record:A:0:0", "record:A:1:1", "completed:A"]
        );
        assert_eq!(source.description(), "scripted_0[memory]");
    }

    #[test]
    fn test_synchronous_failure_propagates() {
        let runtime = SourceRuntime::new();
        let (source, log) = source(
            &runtime,
            Scripted {
                count: 1,
                forever: false,
                fail: true,
            },
        );

        let err = source.request(Query::new(["A"]), false).unwrap_err();
        assert!(matches!(err, DataHubError::Backend(_)));
        assert_eq!(source.state(), SourceState::Failed);
        assert!(source.last_error().unwrap().contains("connection reset"));
        assert_eq!(log.events().last().map(String::as_str), Some("completed:A"));
    }

    #[test]
    fn test_invalid_modulo_rejected() {
        let runtime = SourceRuntime::new();
        let (source, log) = source(
            &runtime,
            Scripted {
                count: 1,
                forever: false,
                fail: false,
            },
        );
        let err = source
            .request(Query::new(["A"]).with_modulo("often"), false)
            .unwrap_err();
        assert!(matches!(err, DataHubError::Config(_)));
        assert_eq!(source.state(), SourceState::Idle);
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_prefix_uses_source_id() {
        let runtime = SourceRuntime::new();
        let (source, log) = source(
            &runtime,
            Scripted {
                count: 1,
                forever: false,
                fail: false,
            },
        );
        source
            .request(Query::new(["A"]).with_prefix(PrefixSpec::Flag(true)), false)
            .unwrap();
        assert_eq!(log.events()[0], "header:scripted_0:A");

        source.set_id("cam");
        source
            .request(Query::new(["A"]).with_prefix(PrefixSpec::Flag(true)), false)
            .unwrap();
        assert!(log.events().contains(&"header:cam:A".to_string()));
    }

    #[test]
    fn test_background_abort_and_rerequest() {
        let runtime = SourceRuntime::new();
        let (source, log) = source(
            &runtime,
            Scripted {
                count: 0,
                forever: true,
                fail: false,
            },
        );

        source.request(Query::new(["A", "B"]), true).unwrap();
        assert!(matches!(
            source.request(Query::new(["A"]), true),
            Err(DataHubError::OngoingQuery)
        ));
        assert!(matches!(source.search("x"), Err(DataHubError::OngoingQuery)));

        std::thread::sleep(Duration::from_millis(20));
        source.abort();
        assert!(source.join(Some(Duration::from_secs(5))));
        assert_eq!(source.state(), SourceState::Aborted);

        let events = log.events();
        assert!(events.contains(&"completed:A".to_string()));
        assert!(events.contains(&"completed:B".to_string()));

        source.request(Query::new(["A"]), true).unwrap();
        assert_eq!(source.query_id().as_deref(), Some("scripted_1"));
        source.close();
        assert!(!source.is_running());
    }

    #[test]
    fn test_cleanup_all_stops_live_sources() {
        let runtime = SourceRuntime::new();
        let (source, log) = source(
            &runtime,
            Scripted {
                count: 0,
                forever: true,
                fail: false,
            },
        );
        source.request(Query::new(["A"]), true).unwrap();
        assert_eq!(runtime.live_count(), 1);

        std::thread::sleep(Duration::from_millis(10));
        runtime.cleanup_all();
        assert!(!source.is_running());
        assert_eq!(runtime.live_count(), 0);
        assert_eq!(log.events().last().map(String::as_str), Some("completed:A"));
    }

    #[test]
    fn test_default_search_unsupported() {
        let runtime = SourceRuntime::new();
        let (source, _) = source(
            &runtime,
            Scripted {
                count: 1,
                forever: false,
                fail: false,
            },
        );
        assert!(matches!(
            source.search("BPM"),
            Err(DataHubError::Unsupported(_))
        ));
    }
}
