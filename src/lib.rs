//! # DataHub-RS: Time-Series Retrieval Hub
//!
//! Retrieves time-series and event data from live and archival sources and
//! fans it out to pluggable consumers through one normalized event protocol:
//! for every channel, a header, then records, then a completion.
//!
//! ## Architecture
//!
//! - **Source**: lifecycle of one query (range, downsampling, prefix,
//!   background execution, abort) around a pluggable [`source::Adapter`]
//! - **Sources**: concrete adapters (archive frame streams, message bus,
//!   synthetic signals) selected through [`sources::SourceConfig`]
//! - **Alignment**: id-ordered merging of per-channel samples into rows
//! - **Protocol**: the length-framed binary stream decoder
//! - **Consumers**: reference [`source::Listener`] implementations
//!
//! ## Example
//!
//! ```ignore
//! use datahub_rs::{
//!     consumers::Table,
//!     source::{Source, SourceRuntime, SourceSettings},
//!     sources::{SimulatedAdapter, SimulatedOptions},
//! };
//! use std::sync::Arc;
//!
//! let runtime = SourceRuntime::new();
//! let source = Source::new(
//!     &runtime,
//!     Box::new(SimulatedAdapter::new(SimulatedOptions::default())),
//!     SourceSettings::default(),
//! );
//! let table = Arc::new(Table::new());
//! source.add_listener(table.clone());
//! source.req(["sine", "counter"], Some(0.into()), Some(2.into()), false)?;
//! println!("{} records", table.len());
//! ```

pub mod align;
pub mod compression;
pub mod config;
pub mod consumers;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod range;
pub mod scripting;
pub mod source;
pub mod sources;
pub mod types;

// Re-export commonly used types
pub use align::{AlignedRow, AlignmentBuffer};
pub use config::{Query, TaskConfig};
pub use error::{DataHubError, Result};
pub use range::TimeRange;
pub use source::{Adapter, Listener, RunContext, Source, SourceRuntime, SourceSettings, SourceState};
pub use sources::{create_source, SourceConfig};
pub use types::{DataType, RecordTime, TimeType, Timestamp, Value};
