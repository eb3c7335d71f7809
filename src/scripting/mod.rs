//! Rhai record filters
//!
//! Message-bus style sources accept a `filter` query parameter: a boolean
//! Rhai expression evaluated against every aligned record before delivery.
//! Records for which the expression is false, or fails to evaluate, are
//! dropped.
//!
//! ## Variables
//!
//! - `id` - Record id (pulse id)
//! - `timestamp` - Record timestamp in nanoseconds
//! - `row` - Map of channel name to value; use `row["S10-BPM:X"]` for names
//!   that are not identifiers
//! - every channel whose name is a valid identifier, by name
//!
//! Arrays are exposed as Rhai arrays, compressed blobs as `()`.
//!
//! ## Example Filters
//!
//! Only pulses where the beam was on:
//! ```rhai
//! beam_on && charge > 10.0
//! ```
//!
//! Every tenth pulse with a valid position:
//! ```rhai
//! id % 10 == 0 && !is_nan(row["S10-BPM:X"])
//! ```

mod filter;

pub use filter::RecordFilter;
