//! Configuration module for DataHub-RS
//!
//! This module handles run configuration including:
//! - [`Query`] - what a single source retrieves
//! - [`TaskConfig`] - a whole run: sources, their queries, consumers and logging
//! - [`LoggingConfig`] - tracing filter and optional rolling log files
//!
//! Task files are TOML (`.toml`) or JSON (`.json`). Global `start`, `end`,
//! `interval`, `modulo` and `mode` values act as defaults for every source
//! query that does not set its own.
//!
//! # Example
//!
//! ```toml
//! start = -60
//! end = 0
//! print = true
//!
//! [[sources]]
//! name = "archive"
//! adapter = { type = "daqbuf", directory = "captures" }
//! query = { channels = ["S10-BPM:X", "S10-BPM:Y"] }
//! ```
//!
//! # App Data Location
//!
//! Log files default to the platform data directory:
//! - **Linux**: `~/.local/share/ch.psi.datahub-rs/logs/`
//! - **macOS**: `~/Library/Application Support/ch.psi.datahub-rs/logs/`
//! - **Windows**: `%APPDATA%\ch.psi.datahub-rs\logs\`

pub mod query;

pub use query::*;

use crate::error::{DataHubError, Result};
use crate::source::SourceSettings;
use crate::sources::SourceConfig;
use crate::types::TimeType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "ch.psi.datahub-rs";

/// Default tracing filter when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,datahub_rs=debug";

/// Default log file name prefix (a date suffix is appended daily)
pub const DEFAULT_LOG_FILE_PREFIX: &str = "datahub.log";

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Default directory for rolling log files
pub fn default_log_dir() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join("logs"))
}

// ==================== Logging Config ====================

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter directive; `RUST_LOG` takes precedence when set
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Also write a daily-rolling log file
    #[serde(default)]
    pub to_file: bool,

    /// Log directory (platform data directory when absent)
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Log file name prefix
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,

    /// Colored terminal output
    #[serde(default = "default_true")]
    pub ansi: bool,
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

fn default_log_file_prefix() -> String {
    DEFAULT_LOG_FILE_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            to_file: false,
            directory: None,
            file_prefix: default_log_file_prefix(),
            ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Directory log files go to, if file logging is enabled
    pub fn resolved_directory(&self) -> Option<PathBuf> {
        if !self.to_file {
            return None;
        }
        self.directory.clone().or_else(default_log_dir)
    }
}

// ==================== Task Config ====================

/// One source of a task: adapter options, identity and its query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Display name; defaults to the source id
    #[serde(default)]
    pub name: Option<String>,

    /// Overrides the generated query id
    #[serde(default)]
    pub id: Option<String>,

    /// Output timestamp representation
    #[serde(default)]
    pub time_type: Option<TimeType>,

    /// Decompress compressed channels before delivery
    #[serde(default)]
    pub auto_decompress: Option<bool>,

    /// Adapter selection and options
    pub adapter: SourceConfig,

    /// What to retrieve
    #[serde(default)]
    pub query: Query,
}

impl SourceEntry {
    /// Source-level settings, falling back to task-wide defaults
    pub fn settings(&self, task: &TaskConfig) -> SourceSettings {
        SourceSettings {
            name: self.name.clone(),
            time_type: self.time_type.or(task.time_type).unwrap_or_default(),
            auto_decompress: self.auto_decompress.or(task.decompress).unwrap_or(false),
        }
    }
}

/// A complete run description
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskConfig {
    /// Default range start for every source
    #[serde(default)]
    pub start: Option<BoundSpec>,

    /// Default range end for every source
    #[serde(default)]
    pub end: Option<BoundSpec>,

    /// Default range mode
    #[serde(default)]
    pub mode: Option<RangeMode>,

    /// Default downsampling interval in seconds
    #[serde(default)]
    pub interval: Option<NumberSpec>,

    /// Default downsampling modulo
    #[serde(default)]
    pub modulo: Option<NumberSpec>,

    /// Default timestamp representation
    #[serde(default)]
    pub time_type: Option<TimeType>,

    /// Default auto-decompression switch
    #[serde(default)]
    pub decompress: Option<bool>,

    /// Run a catalog search with this pattern instead of retrieving
    #[serde(default)]
    pub search: Option<String>,

    /// Print every event to stdout
    #[serde(default)]
    pub print: bool,

    /// Collect records into a table and print a summary at the end
    #[serde(default)]
    pub table: bool,

    /// Per-source join timeout in seconds (unbounded when absent)
    #[serde(default)]
    pub timeout: Option<f64>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

impl TaskConfig {
    /// Load a task file; the format follows the extension (TOML unless `.json`)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DataHubError::Config(format!("Failed to read task file {:?}: {}", path, e))
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let mut task: TaskConfig = if is_json {
            serde_json::from_str(&content).map_err(|e| {
                DataHubError::Config(format!("Failed to parse task file {:?}: {}", path, e))
            })?
        } else {
            toml::from_str(&content).map_err(|e| {
                DataHubError::Config(format!("Failed to parse task file {:?}: {}", path, e))
            })?
        };

        task.apply_defaults();
        Ok(task)
    }

    /// Copy task-wide query defaults into every source query that lacks them
    pub fn apply_defaults(&mut self) {
        for entry in &mut self.sources {
            let query = &mut entry.query;
            if query.start.is_none() {
                query.start = self.start.clone();
            }
            if query.end.is_none() {
                query.end = self.end.clone();
            }
            if query.mode.is_none() {
                query.mode = self.mode;
            }
            if query.interval.is_none() {
                query.interval = self.interval.clone();
            }
            if query.modulo.is_none() {
                query.modulo = self.modulo.clone();
            }
        }
    }

    /// Save the task as pretty JSON
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| {
            DataHubError::Config(format!("Failed to write task file {:?}: {}", path, e))
        })
    }
}

// ==================== Tests ====================
