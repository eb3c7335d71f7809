//! Tracing subscriber setup
//!
//! Terminal output goes to stderr so stdout stays free for event output.
//! With `to_file` set, a second non-blocking layer writes daily-rolling
//! files; keep the returned guard alive until shutdown so buffered lines
//! are flushed.

use crate::config::LoggingConfig;
use crate::error::{DataHubError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG` when set, otherwise the configured directive
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter).map_err(|e| {
            DataHubError::Config(format!("Invalid log filter '{}': {}", config.filter, e))
        }),
    }
}

/// Install the global subscriber
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;

    let (file_layer, guard) = match config.resolved_directory() {
        Some(directory) => {
            std::fs::create_dir_all(&directory).map_err(|e| {
                DataHubError::Config(format!(
                    "Failed to create log directory {:?}: {}",
                    directory, e
                ))
            })?;
            let appender = tracing_appender::rolling::daily(&directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(config.ansi)
                .with_thread_names(true),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| DataHubError::Config(format!("Failed to install logger: {}", e)))?;

    Ok(guard)
}
