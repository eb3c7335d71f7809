//! Reference listeners
//!
//! - [`Table`] keeps every record in memory, per channel
//! - [`StdoutWriter`] prints one line per event
//! - [`EventForwarder`] hands events to another thread over a bounded channel

mod forward;
mod stdout;
mod table;

pub use forward::{EventForwarder, SourceEvent, CONTROL_SEND_TIMEOUT};
pub use stdout::StdoutWriter;
pub use table::{MergedTable, Table, TableIndex, TableRow};
