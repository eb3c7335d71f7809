//! Frame payload mapping
//!
//! A payload is a CBOR map. Data frames carry parallel arrays plus a
//! scalar type:
//!
//! | key           | content                                   |
//! |---------------|-------------------------------------------|
//! | `tss`         | timestamps, nanoseconds since epoch       |
//! | `pulses`      | record ids                                |
//! | `values`      | samples (scalars, arrays or byte strings) |
//! | `scalar_type` | element type name ("f64", "u16", ...)     |
//! | `rangeFinal`  | last frame of the channel                 |
//!
//! A map without `scalar_type` is either a keepalive (`type = "keepalive"`),
//! a bare end marker (`rangeFinal = true`), or malformed.

use crate::error::{DataHubError, Result};
use crate::types::{shape_element_count, ArrayData, ArrayValue, DataType, Timestamp, Value};
use ciborium::Value as Cbor;

pub const KEY_TIMESTAMPS: &str = "tss";
pub const KEY_IDS: &str = "pulses";
pub const KEY_VALUES: &str = "values";
pub const KEY_SCALAR_TYPE: &str = "scalar_type";
pub const KEY_RANGE_FINAL: &str = "rangeFinal";
pub const KEY_TYPE: &str = "type";
pub const KEEPALIVE: &str = "keepalive";

/// One decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Control frame, carries no samples
    KeepAlive,
    Batch(RecordBatch),
}

/// Columnar samples of one data frame
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordBatch {
    /// Declared type name; None for a bare end marker
    pub scalar_type: Option<String>,
    pub timestamps: Vec<Timestamp>,
    pub ids: Vec<i64>,
    pub values: Vec<Value>,
    pub range_final: bool,
}

/// One sample of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub id: i64,
    pub value: Value,
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Samples in frame order
    pub fn into_samples(self) -> impl Iterator<Item = Sample> {
        self.timestamps
            .into_iter()
            .zip(self.ids)
            .zip(self.values)
            .map(|((timestamp, id), value)| Sample {
                timestamp,
                id,
                value,
            })
    }

    /// CBOR map representation of this batch
    pub fn to_cbor(&self) -> Cbor {
        let mut entries = Vec::new();
        if let Some(scalar_type) = &self.scalar_type {
            entries.push((
                Cbor::Text(KEY_SCALAR_TYPE.into()),
                Cbor::Text(scalar_type.clone()),
            ));
            entries.push((
                Cbor::Text(KEY_TIMESTAMPS.into()),
                Cbor::Array(self.timestamps.iter().map(|t| Cbor::Integer((*t).into())).collect()),
            ));
            entries.push((
                Cbor::Text(KEY_IDS.into()),
                Cbor::Array(self.ids.iter().map(|i| Cbor::Integer((*i).into())).collect()),
            ));
            entries.push((
                Cbor::Text(KEY_VALUES.into()),
                Cbor::Array(self.values.iter().map(value_to_cbor).collect()),
            ));
        }
        entries.push((Cbor::Text(KEY_RANGE_FINAL.into()), Cbor::Bool(self.range_final)));
        Cbor::Map(entries)
    }
}

/// Classify a decoded payload
pub fn parse_payload(payload: Cbor) -> Result<Frame> {
    let entries = match payload {
        Cbor::Map(entries) => entries,
        other => {
            return Err(DataHubError::MalformedFrame(format!(
                "payload is not a map: {}",
                kind(&other)
            )))
        }
    };

    let mut timestamps = None;
    let mut ids = None;
    let mut values = None;
    let mut scalar_type = None;
    let mut range_final = false;
    let mut frame_type = None;
    let mut keys = Vec::new();

    for (key, value) in entries {
        let Cbor::Text(key) = key else {
            continue;
        };
        match key.as_str() {
            KEY_TIMESTAMPS => timestamps = Some(value),
            KEY_IDS => ids = Some(value),
            KEY_VALUES => values = Some(value),
            KEY_SCALAR_TYPE => {
                scalar_type = match value {
                    Cbor::Text(name) => Some(name),
                    Cbor::Null => None,
                    other => {
                        return Err(DataHubError::MalformedFrame(format!(
                            "scalar_type is {}",
                            kind(&other)
                        )))
                    }
                }
            }
            KEY_RANGE_FINAL => range_final = matches!(value, Cbor::Bool(true)),
            KEY_TYPE => frame_type = value.as_text().map(str::to_string),
            _ => {}
        }
        keys.push(key);
    }

    let Some(scalar_type) = scalar_type else {
        if range_final {
            return Ok(Frame::Batch(RecordBatch {
                range_final,
                ..Default::default()
            }));
        }
        if frame_type.as_deref() == Some(KEEPALIVE) {
            return Ok(Frame::KeepAlive);
        }
        return Err(DataHubError::MalformedFrame(format!(
            "unexpected frame keys: {:?}",
            keys
        )));
    };

    let dtype = DataType::from_name(&scalar_type);
    let values = match values {
        Some(Cbor::Array(items)) => items
            .iter()
            .map(|item| cbor_to_value(item, dtype))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
        Some(other) => {
            return Err(DataHubError::MalformedFrame(format!(
                "values is {}",
                kind(&other)
            )))
        }
    };
    let timestamps = int_column(timestamps, KEY_TIMESTAMPS)?;
    let ids = int_column(ids, KEY_IDS)?;

    if timestamps.len() < values.len() || ids.len() < values.len() {
        return Err(DataHubError::MalformedFrame(format!(
            "{} values but {} timestamps and {} ids",
            values.len(),
            timestamps.len(),
            ids.len()
        )));
    }

    Ok(Frame::Batch(RecordBatch {
        scalar_type: Some(scalar_type),
        timestamps,
        ids,
        values,
        range_final,
    }))
}

fn int_column(column: Option<Cbor>, key: &str) -> Result<Vec<i64>> {
    match column {
        None => Ok(Vec::new()),
        Some(Cbor::Array(items)) => items
            .iter()
            .map(|item| match item {
                Cbor::Integer(i) => i64::try_from(i128::from(*i)).map_err(|_| {
                    DataHubError::MalformedFrame(format!("{} entry out of range", key))
                }),
                Cbor::Float(f) => Ok(*f as i64),
                other => Err(DataHubError::MalformedFrame(format!(
                    "{} entry is {}",
                    key,
                    kind(other)
                ))),
            })
            .collect(),
        Some(other) => Err(DataHubError::MalformedFrame(format!(
            "{} is {}",
            key,
            kind(&other)
        ))),
    }
}

fn kind(value: &Cbor) -> &'static str {
    match value {
        Cbor::Integer(_) => "integer",
        Cbor::Bytes(_) => "bytes",
        Cbor::Float(_) => "float",
        Cbor::Text(_) => "text",
        Cbor::Bool(_) => "bool",
        Cbor::Null => "null",
        Cbor::Tag(_, _) => "tag",
        Cbor::Array(_) => "array",
        Cbor::Map(_) => "map",
        _ => "unknown",
    }
}

/// Convert one CBOR sample, guided by the declared element type
pub fn cbor_to_value(item: &Cbor, dtype: Option<DataType>) -> Result<Value> {
    match item {
        Cbor::Integer(i) => {
            let wide = i128::from(*i);
            Ok(match dtype {
                Some(dt) if dt.is_float() => Value::Float(wide as f64),
                Some(DataType::Bool) => Value::Bool(wide != 0),
                Some(dt) if dt.is_unsigned() => match u64::try_from(wide) {
                    Ok(v) => Value::UInt(v),
                    Err(_) => Value::Int(wide as i64),
                },
                _ => match i64::try_from(wide) {
                    Ok(v) => Value::Int(v),
                    Err(_) => Value::UInt(wide as u64),
                },
            })
        }
        Cbor::Float(f) => Ok(Value::Float(*f)),
        Cbor::Bool(b) => Ok(Value::Bool(*b)),
        Cbor::Text(s) => Ok(Value::Str(s.clone())),
        Cbor::Bytes(bytes) => {
            let dt = dtype.filter(|d| d.size_bytes() > 0).unwrap_or(DataType::U8);
            let count = bytes.len() / dt.size_bytes();
            ArrayValue::from_le_bytes(dt, vec![count], bytes)
                .map(Value::Array)
                .ok_or_else(|| {
                    DataHubError::MalformedFrame(format!(
                        "{} bytes are not a whole number of {}",
                        bytes.len(),
                        dt
                    ))
                })
        }
        Cbor::Tag(_, inner) => cbor_to_value(inner, dtype),
        Cbor::Array(_) => cbor_to_array(item, dtype).map(Value::Array),
        other => Err(DataHubError::MalformedFrame(format!(
            "unsupported sample type {}",
            kind(other)
        ))),
    }
}

/// Flatten nested CBOR arrays (row-major) into an n-dimensional array
fn cbor_to_array(item: &Cbor, dtype: Option<DataType>) -> Result<ArrayValue> {
    let mut shape = Vec::new();
    let mut probe = item;
    while let Cbor::Array(items) = probe {
        shape.push(items.len());
        match items.first() {
            Some(first) => probe = first,
            None => break,
        }
    }

    let mut leaves = Vec::new();
    collect_leaves(item, 0, &shape, &mut leaves)?;

    let dtype = dtype.unwrap_or_else(|| match leaves.first() {
        Some(Cbor::Integer(_)) => DataType::I64,
        Some(Cbor::Bool(_)) => DataType::Bool,
        Some(Cbor::Text(_)) => DataType::Str,
        _ => DataType::F64,
    });

    let malformed = |what: &Cbor| {
        DataHubError::MalformedFrame(format!("{} element in {} array", kind(what), dtype))
    };

    let data = if dtype.is_float() {
        ArrayData::Float(
            leaves
                .iter()
                .map(|leaf| match leaf {
                    Cbor::Float(f) => Ok(*f),
                    Cbor::Integer(i) => Ok(i128::from(*i) as f64),
                    other => Err(malformed(other)),
                })
                .collect::<Result<_>>()?,
        )
    } else if dtype.is_unsigned() {
        ArrayData::UInt(
            leaves
                .iter()
                .map(|leaf| match leaf {
                    Cbor::Integer(i) => Ok(i128::from(*i) as u64),
                    other => Err(malformed(other)),
                })
                .collect::<Result<_>>()?,
        )
    } else if dtype.is_signed() {
        ArrayData::Int(
            leaves
                .iter()
                .map(|leaf| match leaf {
                    Cbor::Integer(i) => Ok(i128::from(*i) as i64),
                    other => Err(malformed(other)),
                })
                .collect::<Result<_>>()?,
        )
    } else if dtype == DataType::Bool {
        ArrayData::Bool(
            leaves
                .iter()
                .map(|leaf| match leaf {
                    Cbor::Bool(b) => Ok(*b),
                    Cbor::Integer(i) => Ok(i128::from(*i) != 0),
                    other => Err(malformed(other)),
                })
                .collect::<Result<_>>()?,
        )
    } else {
        ArrayData::Str(
            leaves
                .iter()
                .map(|leaf| match leaf {
                    Cbor::Text(s) => Ok(s.clone()),
                    other => Err(malformed(other)),
                })
                .collect::<Result<_>>()?,
        )
    };

    Ok(ArrayValue { dtype, shape, data })
}

fn collect_leaves<'a>(
    item: &'a Cbor,
    depth: usize,
    shape: &[usize],
    out: &mut Vec<&'a Cbor>,
) -> Result<()> {
    match (item, shape.get(depth)) {
        (Cbor::Array(items), Some(&len)) if items.len() == len => {
            for child in items {
                collect_leaves(child, depth + 1, shape, out)?;
            }
            Ok(())
        }
        (Cbor::Array(_), _) => Err(DataHubError::MalformedFrame(
            "ragged nested array".to_string(),
        )),
        (leaf, None) => {
            out.push(leaf);
            Ok(())
        }
        (_, Some(_)) => Err(DataHubError::MalformedFrame(
            "ragged nested array".to_string(),
        )),
    }
}

/// CBOR representation of a sample
pub fn value_to_cbor(value: &Value) -> Cbor {
    match value {
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Int(i) => Cbor::Integer((*i).into()),
        Value::UInt(u) => Cbor::Integer((*u).into()),
        Value::Float(f) => Cbor::Float(*f),
        Value::Str(s) => Cbor::Text(s.clone()),
        Value::Array(array) => array_to_cbor(array),
        Value::Compressed(blob) => Cbor::Bytes(blob.data.clone()),
    }
}

fn array_to_cbor(array: &ArrayValue) -> Cbor {
    let leaves: Vec<Cbor> = match &array.data {
        ArrayData::Bool(v) => v.iter().map(|x| Cbor::Bool(*x)).collect(),
        ArrayData::Int(v) => v.iter().map(|x| Cbor::Integer((*x).into())).collect(),
        ArrayData::UInt(v) => v.iter().map(|x| Cbor::Integer((*x).into())).collect(),
        ArrayData::Float(v) => v.iter().map(|x| Cbor::Float(*x)).collect(),
        ArrayData::Str(v) => v.iter().map(|x| Cbor::Text(x.clone())).collect(),
    };
    nest(leaves, &array.shape)
}

fn nest(leaves: Vec<Cbor>, shape: &[usize]) -> Cbor {
    if shape.len() <= 1 {
        return Cbor::Array(leaves);
    }
    let inner = shape_element_count(&shape[1..]).unwrap_or(0);
    if inner == 0 {
        return Cbor::Array(Vec::new());
    }
    let mut rows = Vec::with_capacity(shape[0]);
    let mut iter = leaves.into_iter();
    for _ in 0..shape[0] {
        let chunk: Vec<Cbor> = iter.by_ref().take(inner).collect();
        rows.push(nest(chunk, &shape[1..]));
    }
    Cbor::Array(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Cbor {
        Cbor::Text(s.to_string())
    }

    #[test]
    fn test_keepalive() {
        let payload = Cbor::Map(vec![(text("type"), text("keepalive"))]);
        assert_eq!(parse_payload(payload).unwrap(), Frame::KeepAlive);
    }

    #[test]
    fn test_bare_range_final() {
        let payload = Cbor::Map(vec![(text("rangeFinal"), Cbor::Bool(true))]);
        match parse_payload(payload).unwrap() {
            Frame::Batch(batch) => {
                assert!(batch.range_final);
                assert!(batch.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_shape_is_malformed() {
        let payload = Cbor::Map(vec![(text("status"), text("busy"))]);
        assert!(matches!(
            parse_payload(payload),
            Err(DataHubError::MalformedFrame(_))
        ));
        assert!(matches!(
            parse_payload(Cbor::Array(vec![])),
            Err(DataHubError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_waveform_values() {
        let payload = Cbor::Map(vec![
            (text("scalar_type"), text("u16")),
            (text("tss"), Cbor::Array(vec![Cbor::Integer(5.into())])),
            (text("pulses"), Cbor::Array(vec![Cbor::Integer(7.into())])),
            (
                text("values"),
                Cbor::Array(vec![Cbor::Array(vec![
                    Cbor::Array(vec![Cbor::Integer(1.into()), Cbor::Integer(2.into())]),
                    Cbor::Array(vec![Cbor::Integer(3.into()), Cbor::Integer(4.into())]),
                ])]),
            ),
        ]);
        let Frame::Batch(batch) = parse_payload(payload).unwrap() else {
            panic!("expected batch");
        };
        let array = batch.values[0].as_array().unwrap();
        assert_eq!(array.shape, vec![2, 2]);
        assert_eq!(array.data, ArrayData::UInt(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_ragged_array_rejected() {
        let ragged = Cbor::Array(vec![
            Cbor::Array(vec![Cbor::Float(1.0)]),
            Cbor::Array(vec![Cbor::Float(1.0), Cbor::Float(2.0)]),
        ]);
        assert!(cbor_to_value(&ragged, Some(DataType::F64)).is_err());
    }

    #[test]
    fn test_missing_timestamps_rejected() {
        let payload = Cbor::Map(vec![
            (text("scalar_type"), text("f64")),
            (text("values"), Cbor::Array(vec![Cbor::Float(1.0)])),
        ]);
        assert!(matches!(
            parse_payload(payload),
            Err(DataHubError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_batch_cbor_roundtrip() {
        let batch = RecordBatch {
            scalar_type: Some("f64".into()),
            timestamps: vec![1, 2],
            ids: vec![10, 11],
            values: vec![
                Value::Array(ArrayValue {
                    dtype: DataType::F64,
                    shape: vec![2, 3],
                    data: ArrayData::Float(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
                }),
                Value::Array(ArrayValue {
                    dtype: DataType::F64,
                    shape: vec![2, 3],
                    data: ArrayData::Float(vec![0.0; 6]),
                }),
            ],
            range_final: true,
        };
        assert_eq!(parse_payload(batch.to_cbor()).unwrap(), Frame::Batch(batch));
    }
}
