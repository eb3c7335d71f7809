//! Core data types for DataHub-RS
//!
//! This module contains the fundamental data structures shared by every
//! source adapter and consumer: sample values, their element types and
//! shapes, and the timestamp representations delivered to listeners.
//!
//! # Main Types
//!
//! - [`DataType`] - Element type of a channel (u8 ... f64, bool, string)
//! - [`Value`] - One sample: scalar, string, n-dimensional array or compressed blob
//! - [`Signature`] - The (type, shape) pair that identifies a channel format
//! - [`TimeType`] / [`RecordTime`] - Output representation of record timestamps
//!
//! # Timestamps
//!
//! Internally every timestamp is an `i64` count of nanoseconds since the
//! UNIX epoch (UTC). Listeners receive it converted to the representation
//! configured on the source.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Nanoseconds since the UNIX epoch, UTC
pub type Timestamp = i64;

/// Free-form per-channel metadata forwarded with a channel header
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Reference time of pulse id 0, in epoch seconds
pub const PULSE_ID_START_TIME: f64 = 1_504_524_711.65;

/// Nominal spacing between consecutive pulse ids, in seconds
pub const PULSE_ID_INTERVAL: f64 = 0.01;

/// Current wall-clock time as a [`Timestamp`]
pub fn now_nanos() -> Timestamp {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Build a timestamp from epoch seconds plus an extra nanosecond offset
pub fn create_timestamp(secs: f64, nanos: i64) -> Timestamp {
    (secs * 1_000_000_000.0) as i64 + nanos
}

/// Convert a timestamp to a `DateTime<Utc>`
pub fn timestamp_to_datetime(ts: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ts)
}

/// ISO-8601 rendering with microsecond precision, e.g. `2024-02-15T12:41:00.000000Z`
pub fn timestamp_to_string(ts: Timestamp) -> String {
    timestamp_to_datetime(ts).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Estimated pulse id at the given epoch time
pub fn time_to_pulse_id(secs: f64) -> i64 {
    ((secs - PULSE_ID_START_TIME) / PULSE_ID_INTERVAL) as i64
}

/// Estimated epoch time of a pulse id, rounded to the pulse interval resolution
pub fn pulse_id_to_time(id: i64) -> f64 {
    let secs = PULSE_ID_START_TIME + id as f64 * PULSE_ID_INTERVAL;
    (secs * 100.0).round() / 100.0
}

/// Element type of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Boolean value
    Bool,
    /// 8-bit unsigned integer
    U8,
    /// 16-bit unsigned integer
    U16,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit unsigned integer
    U64,
    /// 8-bit signed integer
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    #[default]
    F64,
    /// UTF-8 string
    Str,
}

impl DataType {
    /// Returns the size in bytes of one element, or 0 for strings
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 | DataType::Bool => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
            DataType::Str => 0,
        }
    }

    /// Parse a type name as used by archival backends ("f64", "float64", "uint8", ...)
    pub fn from_name(name: &str) -> Option<DataType> {
        let ty = match name.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => DataType::Bool,
            "u8" | "uint8" => DataType::U8,
            "u16" | "uint16" => DataType::U16,
            "u32" | "uint32" => DataType::U32,
            "u64" | "uint64" => DataType::U64,
            "i8" | "int8" => DataType::I8,
            "i16" | "int16" => DataType::I16,
            "i32" | "int32" => DataType::I32,
            "i64" | "int64" | "int" => DataType::I64,
            "f32" | "float32" => DataType::F32,
            "f64" | "float64" | "float" | "double" => DataType::F64,
            "str" | "string" => DataType::Str,
            _ => return None,
        };
        Some(ty)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            DataType::U8 | DataType::U16 | DataType::U32 | DataType::U64
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            DataType::I8 | DataType::I16 | DataType::I32 | DataType::I64
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::U8 => "u8",
            DataType::U16 => "u16",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
            DataType::I8 => "i8",
            DataType::I16 => "i16",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::Str => "string",
        };
        write!(f, "{}", name)
    }
}

/// Byte order announced in channel headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// Compression codec of a channel's raw payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Size-prepended LZ4 block
    Lz4,
    /// Bitshuffle + LZ4, as produced by area detectors
    BitshuffleLz4,
    /// Any other codec name, passed through untouched
    Other(String),
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::Lz4 => write!(f, "lz4"),
            Compression::BitshuffleLz4 => write!(f, "bitshuffle_lz4"),
            Compression::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Element storage of an [`ArrayValue`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayData {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    UInt(Vec<u64>),
    Float(Vec<f64>),
    Str(Vec<String>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::Bool(v) => v.len(),
            ArrayData::Int(v) => v.len(),
            ArrayData::UInt(v) => v.len(),
            ArrayData::Float(v) => v.len(),
            ArrayData::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index` widened to f64 (strings yield None)
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        match self {
            ArrayData::Bool(v) => v.get(index).map(|b| if *b { 1.0 } else { 0.0 }),
            ArrayData::Int(v) => v.get(index).map(|x| *x as f64),
            ArrayData::UInt(v) => v.get(index).map(|x| *x as f64),
            ArrayData::Float(v) => v.get(index).copied(),
            ArrayData::Str(_) => None,
        }
    }
}

/// An n-dimensional array in row-major order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub data: ArrayData,
}

/// Product of the dimensions, None when it does not fit in `usize`
pub fn shape_element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

impl ArrayValue {
    /// One-dimensional float array
    pub fn from_f64(values: Vec<f64>) -> Self {
        Self {
            dtype: DataType::F64,
            shape: vec![values.len()],
            data: ArrayData::Float(values),
        }
    }

    /// One-dimensional signed integer array
    pub fn from_i64(values: Vec<i64>) -> Self {
        Self {
            dtype: DataType::I64,
            shape: vec![values.len()],
            data: ArrayData::Int(values),
        }
    }

    /// Number of elements implied by the shape, None when it overflows
    pub fn element_count(&self) -> Option<usize> {
        shape_element_count(&self.shape)
    }

    /// Shape and storage agree
    pub fn is_consistent(&self) -> bool {
        self.element_count() == Some(self.data.len())
    }

    /// Decode little-endian packed elements of `dtype`.
    ///
    /// Returns None when the byte count does not match the shape or the
    /// shape describes more bytes than fit in `usize`.
    pub fn from_le_bytes(dtype: DataType, shape: Vec<usize>, bytes: &[u8]) -> Option<Self> {
        let size = dtype.size_bytes();
        let expected = shape_element_count(&shape)?.checked_mul(size)?;
        if size == 0 || bytes.len() != expected {
            return None;
        }

        let chunks = bytes.chunks_exact(size);
        let data = match dtype {
            DataType::Bool => ArrayData::Bool(chunks.map(|c| c[0] != 0).collect()),
            DataType::U8 => ArrayData::UInt(chunks.map(|c| c[0] as u64).collect()),
            DataType::I8 => ArrayData::Int(chunks.map(|c| c[0] as i8 as i64).collect()),
            DataType::U16 => {
                ArrayData::UInt(chunks.map(|c| u16::from_le_bytes([c[0], c[1]]) as u64).collect())
            }
            DataType::I16 => {
                ArrayData::Int(chunks.map(|c| i16::from_le_bytes([c[0], c[1]]) as i64).collect())
            }
            DataType::U32 => ArrayData::UInt(
                chunks
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as u64)
                    .collect(),
            ),
            DataType::I32 => ArrayData::Int(
                chunks
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                    .collect(),
            ),
            DataType::F32 => ArrayData::Float(
                chunks
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                    .collect(),
            ),
            DataType::U64 => ArrayData::UInt(
                chunks
                    .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DataType::I64 => ArrayData::Int(
                chunks
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DataType::F64 => ArrayData::Float(
                chunks
                    .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DataType::Str => return None,
        };

        Some(Self { dtype, shape, data })
    }
}

/// A still-compressed payload; materialized by the decompression collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedValue {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub compression: Compression,
    pub data: Vec<u8>,
}

/// A single sample value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Array(ArrayValue),
    Compressed(CompressedValue),
}

/// The (type, shape) format of a channel; a change forces a new header
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub dtype: DataType,
    /// Empty for scalars and strings
    pub shape: Vec<usize>,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.shape)
    }
}

impl Value {
    /// Format signature of this value
    pub fn signature(&self) -> Signature {
        let (dtype, shape) = match self {
            Value::Bool(_) => (DataType::Bool, Vec::new()),
            Value::Int(_) => (DataType::I64, Vec::new()),
            Value::UInt(_) => (DataType::U64, Vec::new()),
            Value::Float(_) => (DataType::F64, Vec::new()),
            Value::Str(_) => (DataType::Str, Vec::new()),
            Value::Array(a) => (a.dtype, a.shape.clone()),
            Value::Compressed(c) => (c.dtype, c.shape.clone()),
        };
        Signature { dtype, shape }
    }

    /// Compression declared by the value itself
    pub fn compression(&self) -> Option<&Compression> {
        match self {
            Value::Compressed(c) => Some(&c.compression),
            _ => None,
        }
    }

    /// Structural validity: array storage matches its shape
    pub fn is_well_formed(&self) -> bool {
        match self {
            Value::Array(a) => a.is_consistent(),
            Value::Compressed(c) => !c.data.is_empty() || c.shape.iter().product::<usize>() == 0,
            Value::Float(_) | Value::Int(_) | Value::UInt(_) | Value::Bool(_) | Value::Str(_) => {
                true
            }
        }
    }

    /// Scalar value widened to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<ArrayValue> for Value {
    fn from(v: ArrayValue) -> Self {
        Value::Array(v)
    }
}

/// Maximum number of array elements rendered by `Display`
const DISPLAY_MAX_ELEMENTS: usize = 8;

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{:?}", v),
            Value::Array(a) => {
                write!(f, "[")?;
                let n = a.data.len();
                for i in 0..n.min(DISPLAY_MAX_ELEMENTS) {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match &a.data {
                        ArrayData::Str(v) => write!(f, "{:?}", v[i])?,
                        data => write!(f, "{}", data.get_f64(i).unwrap_or(f64::NAN))?,
                    }
                }
                if n > DISPLAY_MAX_ELEMENTS {
                    write!(f, ", ... ({} elements)", n)?;
                }
                write!(f, "]")
            }
            Value::Compressed(c) => {
                write!(f, "<{} {} bytes {}{:?}>", c.compression, c.data.len(), c.dtype, c.shape)
            }
        }
    }
}

/// Output representation of record timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeType {
    /// Integer nanoseconds
    #[default]
    #[serde(alias = "int", alias = "nanos")]
    Nano,
    /// Integer milliseconds
    #[serde(alias = "millis", alias = "milliseconds")]
    Milli,
    /// Float seconds
    #[serde(alias = "secs", alias = "seconds", alias = "float")]
    Sec,
    /// ISO-8601 string
    #[serde(alias = "string")]
    Str,
}

impl TimeType {
    /// Parse the names accepted on the command line and in task files
    pub fn from_name(name: &str) -> TimeType {
        match name.trim().to_ascii_lowercase().as_str() {
            "str" | "string" => TimeType::Str,
            "sec" | "secs" | "seconds" | "float" => TimeType::Sec,
            "milli" | "millis" | "milliseconds" => TimeType::Milli,
            _ => TimeType::Nano,
        }
    }

    /// Convert an internal timestamp to this representation
    pub fn convert(&self, ts: Timestamp) -> RecordTime {
        match self {
            TimeType::Nano => RecordTime::Nanos(ts),
            TimeType::Milli => RecordTime::Millis(ts.div_euclid(1_000_000)),
            TimeType::Sec => RecordTime::Secs(ts as f64 / 1e9),
            TimeType::Str => RecordTime::Text(timestamp_to_string(ts)),
        }
    }
}

/// A record timestamp as delivered to listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordTime {
    Nanos(i64),
    Millis(i64),
    Secs(f64),
    Text(String),
}

impl RecordTime {
    /// Approximate epoch seconds of this timestamp
    pub fn as_secs_f64(&self) -> Option<f64> {
        match self {
            RecordTime::Nanos(n) => Some(*n as f64 / 1e9),
            RecordTime::Millis(m) => Some(*m as f64 / 1e3),
            RecordTime::Secs(s) => Some(*s),
            RecordTime::Text(t) => DateTime::parse_from_rfc3339(t)
                .ok()
                .and_then(|dt| dt.timestamp_nanos_opt())
                .map(|n| n as f64 / 1e9),
        }
    }
}

impl fmt::Display for RecordTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordTime::Nanos(n) => write!(f, "{}", n),
            RecordTime::Millis(m) => write!(f, "{}", m),
            RecordTime::Secs(s) => write!(f, "{:.9}", s),
            RecordTime::Text(t) => write!(f, "{}", t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_names() {
        assert_eq!(DataType::from_name("float64"), Some(DataType::F64));
        assert_eq!(DataType::from_name("f64"), Some(DataType::F64));
        assert_eq!(DataType::from_name("UINT16"), Some(DataType::U16));
        assert_eq!(DataType::from_name("string"), Some(DataType::Str));
        assert_eq!(DataType::from_name("complex"), None);
        assert_eq!(DataType::I32.to_string(), "i32");
    }

    #[test]
    fn test_signature_distinguishes_shape() {
        let a = Value::Array(ArrayValue::from_f64(vec![1.0, 2.0]));
        let b = Value::Array(ArrayValue::from_f64(vec![1.0, 2.0, 3.0]));
        assert_ne!(a.signature(), b.signature());
        assert_eq!(Value::Float(1.0).signature(), Value::Float(2.0).signature());
        assert_ne!(Value::Float(1.0).signature(), Value::Int(1).signature());
    }

    #[test]
    fn test_array_from_le_bytes() {
        let bytes: Vec<u8> = [1.5f32, -2.0f32]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let array = ArrayValue::from_le_bytes(DataType::F32, vec![2], &bytes).unwrap();
        assert_eq!(array.data, ArrayData::Float(vec![1.5, -2.0]));

        assert!(ArrayValue::from_le_bytes(DataType::F32, vec![3], &bytes).is_none());
    }

    #[test]
    fn test_oversized_shape_is_rejected() {
        assert_eq!(shape_element_count(&[3, 4]), Some(12));
        assert_eq!(shape_element_count(&[usize::MAX, 2]), None);
        assert_eq!(shape_element_count(&[usize::MAX, 0]), Some(0));

        // count fits but count * size does not
        let huge = usize::MAX / 4 + 1;
        assert!(ArrayValue::from_le_bytes(DataType::F64, vec![huge], &[0u8; 8]).is_none());
        assert!(ArrayValue::from_le_bytes(DataType::U8, vec![usize::MAX, 2], &[0u8; 2]).is_none());

        let array = ArrayValue {
            dtype: DataType::U8,
            shape: vec![usize::MAX, 2],
            data: ArrayData::UInt(vec![0, 0]),
        };
        assert_eq!(array.element_count(), None);
        assert!(!array.is_consistent());
        assert!(!Value::Array(array).is_well_formed());
    }

    #[test]
    fn test_well_formed() {
        let bad = Value::Array(ArrayValue {
            dtype: DataType::I64,
            shape: vec![2, 2],
            data: ArrayData::Int(vec![1, 2, 3]),
        });
        assert!(!bad.is_well_formed());
        assert!(Value::Array(ArrayValue::from_i64(vec![1, 2, 3])).is_well_formed());
    }

    #[test]
    fn test_time_type_conversion() {
        let ts: Timestamp = 1_700_000_000_123_456_789;
        assert_eq!(TimeType::Nano.convert(ts), RecordTime::Nanos(ts));
        assert_eq!(TimeType::Milli.convert(ts), RecordTime::Millis(1_700_000_000_123));
        match TimeType::Sec.convert(ts) {
            RecordTime::Secs(s) => assert!((s - 1_700_000_000.123_456_789).abs() < 1e-6),
            other => panic!("unexpected {:?}", other),
        }
        match TimeType::Str.convert(ts) {
            RecordTime::Text(t) => assert_eq!(t, "2023-11-14T22:13:20.123456Z"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_time_type_aliases() {
        assert_eq!(TimeType::from_name("seconds"), TimeType::Sec);
        assert_eq!(TimeType::from_name("millis"), TimeType::Milli);
        assert_eq!(TimeType::from_name("string"), TimeType::Str);
        assert_eq!(TimeType::from_name("whatever"), TimeType::Nano);
    }

    #[test]
    fn test_pulse_id_roundtrip_estimate() {
        let t = pulse_id_to_time(1000);
        assert!((t - (PULSE_ID_START_TIME + 10.0)).abs() < 0.011);
        assert_eq!(time_to_pulse_id(PULSE_ID_START_TIME + 1.0), 100);
    }

    #[test]
    fn test_create_timestamp() {
        assert_eq!(create_timestamp(1.5, 10), 1_500_000_010);
    }
}
