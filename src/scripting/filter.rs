//! Boolean record filters

use crate::error::{DataHubError, Result};
use crate::types::{ArrayData, Timestamp, Value};
use rhai::{Array, Dynamic, Engine, Map, Scope, AST};
use std::collections::BTreeMap;

/// A compiled boolean expression over one aligned record
pub struct RecordFilter {
    engine: Engine,
    ast: AST,
    source: String,
}

impl RecordFilter {
    /// Compile a filter expression; syntax errors are `Filter` errors
    pub fn compile(source: &str) -> Result<Self> {
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine);

        let ast = engine
            .compile_expression(source)
            .map_err(|e| DataHubError::Filter(format!("Invalid filter '{}': {}", source, e)))?;

        Ok(Self {
            engine,
            ast,
            source: source.to_string(),
        })
    }

    /// Safety limits: filters run once per record on the acquisition path
    fn configure_engine(engine: &mut Engine) {
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(16);
        engine.set_max_operations(10_000);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(10_000);

        engine.register_fn("abs", |x: f64| x.abs());
        engine.register_fn("abs", |x: i64| x.abs());
        engine.register_fn("min", |a: f64, b: f64| a.min(b));
        engine.register_fn("max", |a: f64, b: f64| a.max(b));
        engine.register_fn("is_nan", |x: f64| x.is_nan());
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a record.
    ///
    /// The scope holds `id`, `timestamp` (ns), `row` (channel → value map)
    /// and every channel whose name is a valid identifier.
    pub fn evaluate(
        &self,
        id: i64,
        timestamp: Timestamp,
        row: &BTreeMap<String, Value>,
    ) -> Result<bool> {
        let mut scope = Scope::new();
        scope.push("id", id);
        scope.push("timestamp", timestamp);

        let mut map = Map::new();
        for (name, value) in row {
            let dynamic = to_dynamic(value);
            if is_identifier(name) {
                scope.push_dynamic(name.clone(), dynamic.clone());
            }
            map.insert(name.as_str().into(), dynamic);
        }
        scope.push("row", map);

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(|e| DataHubError::Filter(format!("Evaluation error: {}", e)))?;

        result.as_bool().map_err(|actual| {
            DataHubError::Filter(format!("Filter must return a boolean, got {}", actual))
        })
    }
}

impl std::fmt::Debug for RecordFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordFilter")
            .field("source", &self.source)
            .finish()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !matches!(name, "id" | "timestamp" | "row")
}

/// Convert a sample into a script value
fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Bool(v) => Dynamic::from(*v),
        Value::Int(v) => Dynamic::from(*v),
        Value::UInt(v) => match i64::try_from(*v) {
            Ok(i) => Dynamic::from(i),
            Err(_) => Dynamic::from(*v as f64),
        },
        Value::Float(v) => Dynamic::from(*v),
        Value::Str(v) => Dynamic::from(v.clone()),
        Value::Array(array) => {
            let items: Array = match &array.data {
                ArrayData::Bool(v) => v.iter().map(|x| Dynamic::from(*x)).collect(),
                ArrayData::Int(v) => v.iter().map(|x| Dynamic::from(*x)).collect(),
                ArrayData::UInt(v) => v.iter().map(|x| Dynamic::from(*x as i64)).collect(),
                ArrayData::Float(v) => v.iter().map(|x| Dynamic::from(*x)).collect(),
                ArrayData::Str(v) => v.iter().map(|x| Dynamic::from(x.clone())).collect(),
            };
            Dynamic::from_array(items)
        }
        Value::Compressed(_) => Dynamic::UNIT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArrayValue;

    fn row(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_identifier_channels() {
        let filter = RecordFilter::compile("x > 1.0 && flag").unwrap();
        let ok = row(&[("x", Value::Float(2.0)), ("flag", Value::Bool(true))]);
        let low = row(&[("x", Value::Float(0.5)), ("flag", Value::Bool(true))]);
        assert!(filter.evaluate(1, 0, &ok).unwrap());
        assert!(!filter.evaluate(1, 0, &low).unwrap());
    }

    #[test]
    fn test_row_map_for_non_identifier_names() {
        let filter = RecordFilter::compile(r#"row["S10-BPM:X"] < 0 && id % 2 == 0"#).unwrap();
        let data = row(&[("S10-BPM:X", Value::Int(-3))]);
        assert!(filter.evaluate(10, 0, &data).unwrap());
        assert!(!filter.evaluate(11, 0, &data).unwrap());
    }

    #[test]
    fn test_array_channel() {
        let filter = RecordFilter::compile("wf.len() == 3 && wf[0] == 1.0").unwrap();
        let data = row(&[("wf", Value::Array(ArrayValue::from_f64(vec![1.0, 2.0, 3.0])))]);
        assert!(filter.evaluate(0, 0, &data).unwrap());
    }

    #[test]
    fn test_compile_error() {
        let err = RecordFilter::compile("x >").unwrap_err();
        assert!(matches!(err, DataHubError::Filter(_)));
    }

    #[test]
    fn test_missing_channel_is_error() {
        let filter = RecordFilter::compile("y > 0").unwrap();
        assert!(filter.evaluate(0, 0, &row(&[("x", Value::Int(1))])).is_err());
    }

    #[test]
    fn test_non_boolean_result() {
        let filter = RecordFilter::compile("x + 1").unwrap();
        assert!(filter.evaluate(0, 0, &row(&[("x", Value::Int(1))])).is_err());
    }
}
