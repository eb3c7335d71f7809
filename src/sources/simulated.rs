//! Synthetic signal source
//!
//! Generates one sample per requested channel at a fixed rate, stamped with
//! the wall clock and the pulse id of that instant. Useful for demos and for
//! exercising consumers without a facility connection.
//!
//! # Patterns
//!
//! - [`SignalPattern::Constant`] - fixed value
//! - [`SignalPattern::Sine`] - sinusoid with frequency, amplitude and offset
//! - [`SignalPattern::Counter`] - incrementing counter with wrap-around
//! - [`SignalPattern::Sawtooth`] - linear ramp that resets every period
//! - [`SignalPattern::Square`] - alternates between `+amplitude` and `-amplitude`
//!
//! A channel takes its pattern from the `patterns` table, then from its own
//! name when that names a pattern (`"sine"`, `"counter"`, ...), and falls back
//! to the default `pattern`.

use crate::config::Query;
use crate::error::{DataHubError, Result};
use crate::source::{Adapter, CatalogEntry, RunContext};
use crate::types::{now_nanos, time_to_pulse_id, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

pub const TYPE_NAME: &str = "simulated";

/// Shape of a generated signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SignalPattern {
    Constant {
        value: f64,
    },
    Sine {
        frequency: f64,
        amplitude: f64,
        #[serde(default)]
        offset: f64,
    },
    Counter {
        step: f64,
        min: f64,
        max: f64,
    },
    Sawtooth {
        period: f64,
        amplitude: f64,
    },
    Square {
        period: f64,
        amplitude: f64,
    },
}

impl Default for SignalPattern {
    fn default() -> Self {
        SignalPattern::Sine {
            frequency: 1.0,
            amplitude: 1.0,
            offset: 0.0,
        }
    }
}

impl SignalPattern {
    /// Default pattern of a kind, by name
    pub fn from_name(name: &str) -> Option<SignalPattern> {
        Some(match name.to_lowercase().as_str() {
            "constant" => SignalPattern::Constant { value: 1.0 },
            "sine" | "sin" => SignalPattern::default(),
            "counter" => SignalPattern::Counter {
                step: 1.0,
                min: 0.0,
                max: 1000.0,
            },
            "sawtooth" | "ramp" => SignalPattern::Sawtooth {
                period: 1.0,
                amplitude: 1.0,
            },
            "square" => SignalPattern::Square {
                period: 1.0,
                amplitude: 1.0,
            },
            _ => return None,
        })
    }

    pub fn names() -> &'static [&'static str] {
        &["constant", "sine", "counter", "sawtooth", "square"]
    }
}

/// Running state of one generated channel
#[derive(Debug, Clone)]
struct Generator {
    pattern: SignalPattern,
    counter: f64,
}

impl Generator {
    fn new(pattern: SignalPattern) -> Self {
        let counter = match pattern {
            SignalPattern::Counter { min, step, .. } => min - step,
            _ => 0.0,
        };
        Self { pattern, counter }
    }

    fn sample(&mut self, elapsed_secs: f64) -> f64 {
        match self.pattern {
            SignalPattern::Constant { value } => value,
            SignalPattern::Sine {
                frequency,
                amplitude,
                offset,
            } => offset + amplitude * (2.0 * std::f64::consts::PI * frequency * elapsed_secs).sin(),
            SignalPattern::Counter { step, min, max } => {
                self.counter += step;
                if self.counter > max {
                    self.counter = min;
                } else if self.counter < min {
                    self.counter = max;
                }
                self.counter
            }
            SignalPattern::Sawtooth { period, amplitude } => {
                if period <= 0.0 {
                    return 0.0;
                }
                amplitude * ((elapsed_secs % period) / period)
            }
            SignalPattern::Square { period, amplitude } => {
                if period <= 0.0 || elapsed_secs % period < period / 2.0 {
                    amplitude
                } else {
                    -amplitude
                }
            }
        }
    }
}

fn default_rate() -> f64 {
    10.0
}

/// Options of the `simulated` source type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedOptions {
    /// Samples per second and channel
    #[serde(default = "default_rate")]
    pub rate_hz: f64,

    /// Pattern for channels not otherwise configured
    #[serde(default)]
    pub pattern: SignalPattern,

    /// Per-channel patterns
    #[serde(default)]
    pub patterns: BTreeMap<String, SignalPattern>,

    /// Stop after this many samples per channel
    #[serde(default)]
    pub max_samples: Option<u64>,
}

impl Default for SimulatedOptions {
    fn default() -> Self {
        Self {
            rate_hz: default_rate(),
            pattern: SignalPattern::default(),
            patterns: BTreeMap::new(),
            max_samples: None,
        }
    }
}

impl SimulatedOptions {
    pub fn with_rate(mut self, rate_hz: f64) -> Self {
        self.rate_hz = rate_hz;
        self
    }

    pub fn with_pattern(mut self, channel: impl Into<String>, pattern: SignalPattern) -> Self {
        self.patterns.insert(channel.into(), pattern);
        self
    }

    pub fn with_max_samples(mut self, max_samples: u64) -> Self {
        self.max_samples = Some(max_samples);
        self
    }

    fn pattern_for(&self, channel: &str) -> SignalPattern {
        self.patterns
            .get(channel)
            .copied()
            .or_else(|| SignalPattern::from_name(channel))
            .unwrap_or(self.pattern)
    }
}

/// Synthetic source
pub struct SimulatedAdapter {
    options: SimulatedOptions,
}

impl SimulatedAdapter {
    pub fn new(options: SimulatedOptions) -> Self {
        Self { options }
    }

    fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.options.rate_hz)
    }
}

impl Adapter for SimulatedAdapter {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn target(&self) -> Option<String> {
        Some(format!("{} Hz", self.options.rate_hz))
    }

    fn validate(&self, query: &Query) -> Result<()> {
        if query.channels.is_empty() {
            return Err(DataHubError::Config("no channels requested".into()));
        }
        if !(self.options.rate_hz.is_finite() && self.options.rate_hz > 0.0) {
            return Err(DataHubError::Config(format!(
                "invalid rate {} Hz",
                self.options.rate_hz
            )));
        }
        Ok(())
    }

    fn run(&mut self, query: &Query, ctx: &RunContext) -> Result<()> {
        let channels = query.unique_channels();
        let mut generators: Vec<(String, Generator)> = channels
            .iter()
            .map(|name| (name.clone(), Generator::new(self.options.pattern_for(name))))
            .collect();

        let period = self.period();
        let origin = Instant::now();
        let mut next_tick = origin;
        let mut emitted = 0u64;

        loop {
            ctx.cancel().check()?;

            let timestamp: Timestamp = now_nanos();
            let id = time_to_pulse_id(timestamp as f64 / 1e9);
            if ctx.range().has_ended_at(timestamp, Some(id)) {
                break;
            }

            if ctx.range().has_started_at(timestamp, Some(id)) {
                let elapsed = origin.elapsed().as_secs_f64();
                for (name, generator) in generators.iter_mut() {
                    let value = generator.sample(elapsed);
                    ctx.receive(name, Value::Float(value), Some(timestamp), Some(id));
                }
                emitted += 1;
                if self
                    .options
                    .max_samples
                    .is_some_and(|max| emitted >= max)
                {
                    break;
                }
            }

            next_tick += period;
            let now = Instant::now();
            if next_tick > now {
                ctx.cancel().sleep(next_tick - now)?;
            } else {
                // Fell behind; restart the schedule instead of bursting
                next_tick = now;
            }
        }

        debug!("Generated {} sample(s) per channel", emitted);
        Ok(())
    }

    fn search(&mut self, pattern: &str) -> Result<Vec<CatalogEntry>> {
        Ok(SignalPattern::names()
            .iter()
            .filter(|name| name.contains(pattern))
            .map(|name| {
                let mut entry = CatalogEntry::named(*name);
                entry.dtype = Some("f64".into());
                entry
            })
            .collect())
    }
}
