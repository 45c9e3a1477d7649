//! Typed literals for filter operands.

use std::sync::Arc;

use arrow_array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, Scalar, StringArray,
    TimestampMicrosecondArray,
};
use chrono::{DateTime, NaiveDateTime};
use pravah_core::ValueType;

/// A spec literal coerced to a column type at compile time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Ts(i64),
}

impl Literal {
    /// Coerce a JSON literal to the column's type. `None` means the spec is
    /// type-incompatible and compilation should fail.
    pub(crate) fn coerce(value: &serde_json::Value, target: ValueType) -> Option<Self> {
        use serde_json::Value;
        match (target, value) {
            (ValueType::Int64, Value::Number(n)) => n.as_i64().map(Literal::Int),
            (ValueType::Float64, Value::Number(n)) => n.as_f64().map(Literal::Float),
            (ValueType::Bool, Value::Bool(b)) => Some(Literal::Bool(*b)),
            (ValueType::String, Value::String(s)) => Some(Literal::Str(s.clone())),
            (ValueType::Timestamp, Value::String(s)) => {
                parse_timestamp_micros(s).map(Literal::Ts)
            }
            _ => None,
        }
    }

    /// One-element array carrying the literal, for scalar compute kernels.
    pub(crate) fn to_array(&self) -> ArrayRef {
        match self {
            Literal::Int(v) => Arc::new(Int64Array::from(vec![*v])),
            Literal::Float(v) => Arc::new(Float64Array::from(vec![*v])),
            Literal::Bool(v) => Arc::new(BooleanArray::from(vec![*v])),
            Literal::Str(v) => Arc::new(StringArray::from(vec![v.clone()])),
            Literal::Ts(v) => {
                Arc::new(TimestampMicrosecondArray::from(vec![*v]).with_timezone("UTC"))
            }
        }
    }

    pub(crate) fn to_scalar(&self) -> Scalar<ArrayRef> {
        Scalar::new(self.to_array())
    }
}

pub(crate) fn parse_timestamp_micros(value: &str) -> Option<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.timestamp_micros());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().timestamp_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coercion_respects_column_type() {
        let int = serde_json::json!(30);
        assert_eq!(Literal::coerce(&int, ValueType::Int64), Some(Literal::Int(30)));
        assert_eq!(
            Literal::coerce(&int, ValueType::Float64),
            Some(Literal::Float(30.0))
        );
        assert_eq!(Literal::coerce(&int, ValueType::String), None);

        let s = serde_json::json!("2024-03-01T00:00:00Z");
        assert!(matches!(
            Literal::coerce(&s, ValueType::Timestamp),
            Some(Literal::Ts(_))
        ));
        assert_eq!(
            Literal::coerce(&serde_json::json!("x"), ValueType::Timestamp),
            None
        );
    }
}
