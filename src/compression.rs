//! Decompression collaborator
//!
//! Channels may deliver compressed blobs ([`Value::Compressed`]). When a
//! source runs with `auto_decompress`, every such value is handed to a
//! [`Decompressor`] and the materialized array is delivered instead.
//! [`BuiltinDecompressor`] understands size-prepended LZ4 blocks; other
//! codecs need a custom implementation injected into the source.

use crate::error::{DataHubError, Result};
use crate::types::{shape_element_count, ArrayValue, Compression, DataType, Value};

/// Black-box `decompress(bytes, shape, dtype) -> array` contract
pub trait Decompressor: Send + Sync {
    fn decompress(
        &self,
        data: &[u8],
        dtype: DataType,
        shape: &[usize],
        compression: &Compression,
    ) -> Result<Value>;
}

/// LZ4 block decompressor producing little-endian arrays
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinDecompressor;

impl Decompressor for BuiltinDecompressor {
    fn decompress(
        &self,
        data: &[u8],
        dtype: DataType,
        shape: &[usize],
        compression: &Compression,
    ) -> Result<Value> {
        shape_element_count(shape)
            .and_then(|count| count.checked_mul(dtype.size_bytes()))
            .ok_or_else(|| {
                DataHubError::MalformedFrame(format!(
                    "shape {:?} of {} overflows the addressable size",
                    shape, dtype
                ))
            })?;

        let raw = match compression {
            Compression::Lz4 => lz4_flex::block::decompress_size_prepended(data)
                .map_err(|e| DataHubError::Decompression(e.to_string()))?,
            other => {
                return Err(DataHubError::Decompression(format!(
                    "Unsupported codec: {}",
                    other
                )))
            }
        };

        ArrayValue::from_le_bytes(dtype, shape.to_vec(), &raw)
            .map(Value::Array)
            .ok_or_else(|| {
                DataHubError::Decompression(format!(
                    "{} bytes do not match {} {:?}",
                    raw.len(),
                    dtype,
                    shape
                ))
            })
    }
}

/// Compress little-endian packed elements into a size-prepended LZ4 block
pub fn compress_lz4(raw: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress_prepend_size(raw)
}
