//! Error handling for DataHub-RS
//!
//! This module defines the error taxonomy shared by the source lifecycle,
//! the alignment buffer and the framed protocol reader, plus a Result alias
//! for use throughout the crate.

use thiserror::Error;

/// Main error type for DataHub-RS operations
#[derive(Error, Debug)]
pub enum DataHubError {
    /// Invalid query parameters, rejected at `request()` time
    #[error("Configuration error: {0}")]
    Config(String),

    /// `request()` called on a source whose previous query is still running
    #[error("Ongoing query")]
    OngoingQuery,

    /// The stream ended in the middle of a frame payload
    #[error("Protocol error: truncated frame (expected {expected} payload bytes, received {received})")]
    TruncatedFrame { expected: usize, received: usize },

    /// A frame announced a payload larger than the configured limit
    #[error("Protocol error: frame length {length} exceeds limit {limit}")]
    FrameTooLarge { length: usize, limit: usize },

    /// Decodable bytes with an invalid logical shape
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Cooperative cancellation unwound the query
    #[error("Query has been aborted")]
    Aborted,

    /// Operation not supported by this adapter
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Errors reported by an external backend (network, auth, server status)
    #[error("Backend error: {0}")]
    Backend(String),

    /// Errors raised by the decompression collaborator
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Errors compiling or evaluating a record filter
    #[error("Filter error: {0}")]
    Filter(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<DataHubError>,
    },
}

impl DataHubError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        DataHubError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context layers
    pub fn root(&self) -> &DataHubError {
        match self {
            DataHubError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for violations of the framed stream contract
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self.root(),
            DataHubError::TruncatedFrame { .. } | DataHubError::FrameTooLarge { .. }
        )
    }

    /// True when the error is a cooperative cancellation
    pub fn is_aborted(&self) -> bool {
        matches!(self.root(), DataHubError::Aborted)
    }
}

/// Result type alias for DataHub-RS operations
pub type Result<T> = std::result::Result<T, DataHubError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl From<serde_json::Error> for DataHubError {
    fn from(err: serde_json::Error) -> Self {
        DataHubError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for DataHubError {
    fn from(err: toml::de::Error) -> Self {
        DataHubError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DataHubError::Config("Invalid modulo: x".to_string());
        assert_eq!(err.to_string(), "Configuration error: Invalid modulo: x");
    }

    #[test]
    fn test_error_with_context() {
        let err = DataHubError::Backend("connection refused".to_string());
        let with_ctx = err.with_context("Channel A");
        assert!(with_ctx.to_string().contains("Channel A"));
        assert!(with_ctx.to_string().contains("connection refused"));
    }

    #[test]
    fn test_truncated_frame_is_protocol_error() {
        let err = DataHubError::TruncatedFrame {
            expected: 64,
            received: 10,
        };
        assert!(err.is_protocol_error());
        assert!(err.to_string().contains("64"));
        assert!(!DataHubError::MalformedFrame("x".into()).is_protocol_error());
    }

    #[test]
    fn test_oversized_frame_is_protocol_error() {
        let err = DataHubError::FrameTooLarge {
            length: 1 << 30,
            limit: 1 << 20,
        }
        .with_context("daqbuf");
        assert!(err.is_protocol_error());
        assert!(err.to_string().starts_with("daqbuf: Protocol error"));
    }

    #[test]
    fn test_aborted_through_context() {
        let err = DataHubError::Aborted.with_context("daqbuf");
        assert!(err.is_aborted());
        assert!(!err.is_protocol_error());
    }
}
