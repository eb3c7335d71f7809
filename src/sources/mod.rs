//! Concrete source adapters
//!
//! Every adapter implements [`Adapter`] and is selected by the `type` tag of
//! a [`SourceConfig`]:
//!
//! | type        | adapter                        | transport                      |
//! |-------------|--------------------------------|--------------------------------|
//! | `daqbuf`    | [`daqbuf::DaqbufAdapter`]      | length-framed archive streams  |
//! | `bus`       | [`bus::BusAdapter`]            | message-bus entries, aligned   |
//! | `simulated` | [`simulated::SimulatedAdapter`]| synthetic signals              |
//!
//! Network transports are collaborators behind the
//! [`daqbuf::FrameStreamProvider`] and [`bus::BusClient`] traits.

pub mod bus;
pub mod daqbuf;
pub mod simulated;

pub use bus::{BusAdapter, BusClient, BusEntry, BusOptions, MemoryBus, MemoryBusPublisher};
pub use daqbuf::{ArchiveRequest, DaqbufAdapter, DaqbufOptions, DirectoryProvider, FrameStreamProvider};
pub use simulated::{SignalPattern, SimulatedAdapter, SimulatedOptions};

use crate::error::Result;
use crate::source::Adapter;
use serde::{Deserialize, Serialize};

/// Adapter selection plus its options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Daqbuf(DaqbufOptions),
    Bus(BusOptions),
    Simulated(SimulatedOptions),
}

impl SourceConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            SourceConfig::Daqbuf(_) => daqbuf::TYPE_NAME,
            SourceConfig::Bus(_) => bus::TYPE_NAME,
            SourceConfig::Simulated(_) => simulated::TYPE_NAME,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Simulated(SimulatedOptions::default())
    }
}

/// Type tags accepted in task files
pub fn known_source_types() -> &'static [&'static str] {
    &[daqbuf::TYPE_NAME, bus::TYPE_NAME, simulated::TYPE_NAME]
}

/// Build the adapter described by `config`
pub fn create_source(config: &SourceConfig) -> Result<Box<dyn Adapter>> {
    Ok(match config {
        SourceConfig::Daqbuf(options) => Box::new(DaqbufAdapter::from_options(options.clone())?),
        SourceConfig::Bus(options) => Box::new(BusAdapter::from_options(options)?),
        SourceConfig::Simulated(options) => Box::new(SimulatedAdapter::new(options.clone())),
    })
}
