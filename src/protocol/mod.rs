//! Length-framed binary stream protocol
//!
//! Archival backends stream one channel per connection as a sequence of
//! self-delimited frames. [`frame`] handles the byte layout, [`payload`]
//! maps the decoded CBOR maps onto samples.

pub mod frame;
pub mod payload;

pub use frame::{
    decode_channel_stream, encode_batch, encode_frame, write_frame, FrameReader, StreamEnd,
    DEFAULT_MAX_FRAME_LEN,
};
pub use payload::{cbor_to_value, parse_payload, value_to_cbor, Frame, RecordBatch, Sample};
