//! Query definition
//!
//! A [`Query`] is the immutable-once-started description of one retrieval:
//! which channels, over which range, with which downsampling, prefixing and
//! filtering. Adapter-specific knobs travel untouched in [`Query::options`].

use crate::error::{DataHubError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// How `start`/`end` are compared against incoming records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RangeMode {
    /// Bounds are wall-clock times (absolute or relative)
    #[default]
    Time,
    /// Bounds are monotonic record ids (pulse ids)
    Id,
}

/// A raw range bound as written by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoundSpec {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for BoundSpec {
    fn from(v: i64) -> Self {
        BoundSpec::Int(v)
    }
}

impl From<f64> for BoundSpec {
    fn from(v: f64) -> Self {
        BoundSpec::Float(v)
    }
}

impl From<&str> for BoundSpec {
    fn from(v: &str) -> Self {
        BoundSpec::Text(v.to_string())
    }
}

/// A numeric parameter that may also arrive as a string ("10", "0.5")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberSpec {
    Int(i64),
    Float(f64),
    Text(String),
}

impl NumberSpec {
    fn as_f64(&self, what: &str) -> Result<f64> {
        let value = match self {
            NumberSpec::Int(v) => *v as f64,
            NumberSpec::Float(v) => *v,
            NumberSpec::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| DataHubError::Config(format!("Invalid {}: {}", what, s)))?,
        };
        if !value.is_finite() {
            return Err(DataHubError::Config(format!("Invalid {}: {}", what, value)));
        }
        Ok(value)
    }

    /// Resolve as a downsampling interval in seconds (0 disables)
    pub fn resolve_interval(&self) -> Result<f64> {
        let value = self.as_f64("interval")?;
        if value < 0.0 {
            return Err(DataHubError::Config(format!("Invalid interval: {}", value)));
        }
        Ok(value)
    }

    /// Resolve as a modulo divisor (must be a positive integer)
    pub fn resolve_modulo(&self) -> Result<u64> {
        let value = self.as_f64("modulo")?;
        if value < 1.0 || value.fract() != 0.0 {
            return Err(DataHubError::Config(format!("Invalid modulo: {}", value)));
        }
        Ok(value as u64)
    }
}

impl From<u64> for NumberSpec {
    fn from(v: u64) -> Self {
        NumberSpec::Int(v as i64)
    }
}

impl From<f64> for NumberSpec {
    fn from(v: f64) -> Self {
        NumberSpec::Float(v)
    }
}

impl From<&str> for NumberSpec {
    fn from(v: &str) -> Self {
        NumberSpec::Text(v.to_string())
    }
}

/// Channel name namespacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefixSpec {
    Flag(bool),
    Text(String),
}

impl PrefixSpec {
    /// Resolve into the literal prefix prepended to channel names.
    ///
    /// `true` (or the strings "true"/"yes") becomes `"{source_name}:"`,
    /// `false` and "false"/"no"/"" become no prefix, anything else is used as is.
    pub fn resolve(&self, source_name: &str) -> String {
        match self {
            PrefixSpec::Flag(true) => format!("{}:", source_name),
            PrefixSpec::Flag(false) => String::new(),
            PrefixSpec::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => format!("{}:", source_name),
                "false" | "no" | "" => String::new(),
                _ => text.clone(),
            },
        }
    }
}

impl From<bool> for PrefixSpec {
    fn from(v: bool) -> Self {
        PrefixSpec::Flag(v)
    }
}

impl From<&str> for PrefixSpec {
    fn from(v: &str) -> Self {
        PrefixSpec::Text(v.to_string())
    }
}

/// Configuration of one retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Query {
    /// Requested channels, in request order
    #[serde(default)]
    pub channels: Vec<String>,

    /// Range start (None = unbounded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<BoundSpec>,

    /// Range end (None = open-ended)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<BoundSpec>,

    /// Time or id bounds (time when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RangeMode>,

    /// Minimum seconds between deliveries per channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<NumberSpec>,

    /// Deliver every Nth record per channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulo: Option<NumberSpec>,

    /// Channel name prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<PrefixSpec>,

    /// Boolean expression over aligned records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Adapter-specific options, passed through untouched
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Query {
    /// Create a query over the given channels with no bounds
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_range(mut self, start: Option<BoundSpec>, end: Option<BoundSpec>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn with_mode(mut self, mode: RangeMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_interval(mut self, interval: impl Into<NumberSpec>) -> Self {
        self.interval = Some(interval.into());
        self
    }

    pub fn with_modulo(mut self, modulo: impl Into<NumberSpec>) -> Self {
        self.modulo = Some(modulo.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<PrefixSpec>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Effective range mode
    pub fn range_mode(&self) -> RangeMode {
        self.mode.unwrap_or_default()
    }

    /// Channels with duplicates removed, first occurrence wins
    pub fn unique_channels(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.channels
            .iter()
            .filter(|c| seen.insert(c.as_str()))
            .cloned()
            .collect()
    }

    /// Boolean option; accepts JSON booleans, "true"/"false" strings and numbers
    pub fn option_bool(&self, key: &str) -> Option<bool> {
        match self.options.get(key)? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::Number(n) => n.as_f64().map(|v| v != 0.0),
            serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Unsigned integer option; accepts numbers and numeric strings
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        match self.options.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Float option; accepts numbers and numeric strings
    pub fn option_f64(&self, key: &str) -> Option<f64> {
        match self.options.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key)?.as_str()
    }
}
