//! Length-framed stream reader
//!
//! Wire layout of one frame (no escaping, fixed order):
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────┬───────────────────────────┐
//! │ length: i32  │ 12 bytes pad │ length bytes    │ (8 - length % 8) % 8 pad  │
//! │ little-endian│ (ignored)    │ CBOR payload    │ (ignored)                 │
//! └──────────────┴──────────────┴─────────────────┴───────────────────────────┘
//! ```
//!
//! A short read of the length, the leading pad or the trailing pad is a clean
//! end of stream. A short read of the payload is a [`DataHubError::TruncatedFrame`].

use super::payload::{parse_payload, Frame, RecordBatch, Sample};
use crate::error::{DataHubError, Result};
use crate::source::CancelToken;
use std::io::{ErrorKind, Read, Write};
use tracing::{debug, trace};

/// Bytes of ignored padding after the length word
pub const HEADER_PADDING: usize = 12;

/// Frame alignment of the payload + trailing padding
pub const FRAME_ALIGNMENT: usize = 8;

/// Default upper bound on a single payload
pub const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Trailing padding after a payload of `length` bytes
pub fn trailing_padding(length: usize) -> usize {
    (FRAME_ALIGNMENT - length % FRAME_ALIGNMENT) % FRAME_ALIGNMENT
}

/// Decodes frames from a byte stream
pub struct FrameReader<R> {
    reader: R,
    max_frame_len: usize,
    frames_read: u64,
    bytes_read: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            frames_read: 0,
            bytes_read: 0,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read until `buf` is full or the stream ends; returns bytes read
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.bytes_read += filled as u64;
        Ok(filled)
    }

    /// Length word, leading pad and payload; None at clean end of stream
    fn read_body(&mut self) -> Result<Option<Vec<u8>>> {
        let mut word = [0u8; 4];
        if self.fill(&mut word)? < word.len() {
            return Ok(None);
        }
        let length = i32::from_le_bytes(word);
        if length < 0 {
            return Err(DataHubError::MalformedFrame(format!(
                "negative frame length {}",
                length
            )));
        }
        let length = length as usize;
        if length > self.max_frame_len {
            return Err(DataHubError::FrameTooLarge {
                length,
                limit: self.max_frame_len,
            });
        }

        let mut pad = [0u8; HEADER_PADDING];
        if self.fill(&mut pad)? < HEADER_PADDING {
            return Ok(None);
        }

        let mut payload = vec![0u8; length];
        let received = self.fill(&mut payload)?;
        if received < length {
            return Err(DataHubError::TruncatedFrame {
                expected: length,
                received,
            });
        }
        Ok(Some(payload))
    }

    /// Consume the trailing pad; false if the stream closed inside it
    fn skip_trailing(&mut self, length: usize) -> Result<bool> {
        let padding = trailing_padding(length);
        let mut trailing = [0u8; FRAME_ALIGNMENT];
        if self.fill(&mut trailing[..padding])? < padding {
            debug!("Stream ended inside trailing padding");
            return Ok(false);
        }
        self.frames_read += 1;
        Ok(true)
    }

    /// Read the next raw payload; None at clean end of stream
    pub fn next_payload(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(payload) = self.read_body()? else {
            return Ok(None);
        };
        if !self.skip_trailing(payload.len())? {
            return Ok(None);
        }
        Ok(Some(payload))
    }

    /// Read and decode the next frame; None at clean end of stream
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(payload) = self.read_body()? else {
            return Ok(None);
        };
        let decoded: ciborium::Value = ciborium::de::from_reader(payload.as_slice())
            .map_err(|e| DataHubError::MalformedFrame(format!("undecodable payload: {}", e)))?;
        if !self.skip_trailing(payload.len())? {
            return Ok(None);
        }
        let frame = parse_payload(decoded)?;
        trace!("Frame {} ({} bytes)", self.frames_read, payload.len());
        Ok(Some(frame))
    }
}

/// How a channel stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// A frame carried `rangeFinal = true`
    RangeFinal,
    /// The byte stream closed cleanly
    Eof,
}

/// Decode one channel's frame stream, passing every sample to `sink`.
///
/// The cancellation token is checked before every frame; a cancelled
/// decode returns `Aborted`. Keepalive frames are skipped.
pub fn decode_channel_stream<R, F>(reader: R, cancel: &CancelToken, mut sink: F) -> Result<StreamEnd>
where
    R: Read,
    F: FnMut(Sample),
{
    let mut frames = FrameReader::new(reader);
    loop {
        cancel.check()?;
        match frames.next_frame()? {
            None => return Ok(StreamEnd::Eof),
            Some(Frame::KeepAlive) => continue,
            Some(Frame::Batch(batch)) => {
                let range_final = batch.range_final;
                batch.into_samples().for_each(&mut sink);
                if range_final {
                    return Ok(StreamEnd::RangeFinal);
                }
            }
        }
    }
}

/// Write one frame around an already encoded payload
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let length = i32::try_from(payload.len()).map_err(|_| DataHubError::FrameTooLarge {
        length: payload.len(),
        limit: i32::MAX as usize,
    })?;
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&[0u8; HEADER_PADDING])?;
    writer.write_all(payload)?;
    writer.write_all(&[0u8; FRAME_ALIGNMENT][..trailing_padding(payload.len())])?;
    Ok(())
}

/// Encode a CBOR value as a complete frame
pub fn encode_frame(payload: &ciborium::Value) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::ser::into_writer(payload, &mut body)
        .map_err(|e| DataHubError::Serialization(e.to_string()))?;
    let mut out = Vec::with_capacity(body.len() + 24);
    write_frame(&mut out, &body)?;
    Ok(out)
}

/// Encode a record batch as a complete frame
pub fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    encode_frame(&batch.to_cbor())
}
