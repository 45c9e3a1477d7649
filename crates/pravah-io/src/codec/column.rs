//! Typed column assembly shared by the text codecs.

use std::sync::Arc;

use arrow_array::builder::{
    BooleanBuilder, Float64Builder, Int64Builder, StringBuilder, TimestampMicrosecondBuilder,
};
use arrow_array::ArrayRef;
use pravah_core::ValueType;

use super::infer::{parse_bool, parse_timestamp_micros};

/// One column under construction. Appends report whether the value was
/// representable; the caller decides between null and failing the run.
pub(crate) enum ColumnBuilder {
    Int(Int64Builder),
    Float(Float64Builder),
    Bool(BooleanBuilder),
    Str(StringBuilder),
    Ts(TimestampMicrosecondBuilder),
}

impl ColumnBuilder {
    pub(crate) fn new(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Int64 => ColumnBuilder::Int(Int64Builder::new()),
            ValueType::Float64 => ColumnBuilder::Float(Float64Builder::new()),
            ValueType::Bool => ColumnBuilder::Bool(BooleanBuilder::new()),
            ValueType::String => ColumnBuilder::Str(StringBuilder::new()),
            ValueType::Timestamp => ColumnBuilder::Ts(TimestampMicrosecondBuilder::new()),
        }
    }

    pub(crate) fn append_null(&mut self) {
        match self {
            ColumnBuilder::Int(b) => b.append_null(),
            ColumnBuilder::Float(b) => b.append_null(),
            ColumnBuilder::Bool(b) => b.append_null(),
            ColumnBuilder::Str(b) => b.append_null(),
            ColumnBuilder::Ts(b) => b.append_null(),
        }
    }

    /// Append a text cell, parsing it as the column type.
    pub(crate) fn append_text(&mut self, cell: &str) -> bool {
        match self {
            ColumnBuilder::Str(b) => {
                b.append_value(cell);
                true
            }
            ColumnBuilder::Int(b) => match cell.trim().parse::<i64>() {
                Ok(v) => {
                    b.append_value(v);
                    true
                }
                Err(_) => false,
            },
            ColumnBuilder::Float(b) => match cell.trim().parse::<f64>() {
                Ok(v) => {
                    b.append_value(v);
                    true
                }
                Err(_) => false,
            },
            ColumnBuilder::Bool(b) => match parse_bool(cell.trim()) {
                Some(v) => {
                    b.append_value(v);
                    true
                }
                None => false,
            },
            ColumnBuilder::Ts(b) => match parse_timestamp_micros(cell.trim()) {
                Some(v) => {
                    b.append_value(v);
                    true
                }
                None => false,
            },
        }
    }

    /// Append a JSON value. Non-string scalars and nested values land in
    /// string columns as their JSON text.
    pub(crate) fn append_json(&mut self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match (self, value) {
            (ColumnBuilder::Int(b), Value::Number(n)) => match n.as_i64() {
                Some(v) => {
                    b.append_value(v);
                    true
                }
                None => false,
            },
            (ColumnBuilder::Float(b), Value::Number(n)) => match n.as_f64() {
                Some(v) => {
                    b.append_value(v);
                    true
                }
                None => false,
            },
            (ColumnBuilder::Bool(b), Value::Bool(v)) => {
                b.append_value(*v);
                true
            }
            (ColumnBuilder::Str(b), Value::String(s)) => {
                b.append_value(s);
                true
            }
            (ColumnBuilder::Str(b), other) => {
                b.append_value(other.to_string());
                true
            }
            (ColumnBuilder::Ts(b), Value::String(s)) => match parse_timestamp_micros(s) {
                Some(v) => {
                    b.append_value(v);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub(crate) fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Int(b) => Arc::new(b.finish()),
            ColumnBuilder::Float(b) => Arc::new(b.finish()),
            ColumnBuilder::Bool(b) => Arc::new(b.finish()),
            ColumnBuilder::Str(b) => Arc::new(b.finish()),
            ColumnBuilder::Ts(b) => Arc::new(b.finish().with_timezone("UTC")),
        }
    }
}
