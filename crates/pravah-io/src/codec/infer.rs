//! Sample-based type inference for the text formats.
//!
//! Each column climbs the promotion lattice `bool → int64 → float64 →
//! string` as sampled values are observed; a column is a timestamp only if
//! every non-empty sample parses as RFC 3339 (naive timestamps are read as
//! UTC). Columns with no usable sample stay `string`.

use chrono::{DateTime, NaiveDateTime};
use pravah_core::ValueType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lattice {
    Unknown,
    Bool,
    Int,
    Float,
    Timestamp,
    Str,
}

impl Lattice {
    fn numeric_rank(self) -> Option<u8> {
        match self {
            Lattice::Bool => Some(0),
            Lattice::Int => Some(1),
            Lattice::Float => Some(2),
            _ => None,
        }
    }
}

pub(crate) fn classify_text(value: &str) -> Lattice {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Lattice::Unknown;
    }
    if parse_bool(trimmed).is_some() {
        return Lattice::Bool;
    }
    if trimmed.parse::<i64>().is_ok() {
        return Lattice::Int;
    }
    if trimmed.parse::<f64>().is_ok() {
        return Lattice::Float;
    }
    if parse_timestamp_micros(trimmed).is_some() {
        return Lattice::Timestamp;
    }
    Lattice::Str
}

pub(crate) fn combine(a: Lattice, b: Lattice) -> Lattice {
    match (a, b) {
        (Lattice::Unknown, other) | (other, Lattice::Unknown) => other,
        _ if a == b => a,
        _ => match (a.numeric_rank(), b.numeric_rank()) {
            (Some(ra), Some(rb)) => {
                if ra >= rb {
                    a
                } else {
                    b
                }
            }
            // Timestamp mixed with anything else, or anything with Str.
            _ => Lattice::Str,
        },
    }
}

pub(crate) fn to_value_type(lattice: Lattice) -> ValueType {
    match lattice {
        Lattice::Bool => ValueType::Bool,
        Lattice::Int => ValueType::Int64,
        Lattice::Float => ValueType::Float64,
        Lattice::Timestamp => ValueType::Timestamp,
        Lattice::Unknown | Lattice::Str => ValueType::String,
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// RFC 3339 with zone, or a naive `YYYY-MM-DDTHH:MM:SS[.frac]` read as UTC.
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
    fn classification() {
        assert_eq!(classify_text("true"), Lattice::Bool);
        assert_eq!(classify_text("42"), Lattice::Int);
        assert_eq!(classify_text("4.2"), Lattice::Float);
        assert_eq!(classify_text("2024-03-01T08:00:00Z"), Lattice::Timestamp);
        assert_eq!(classify_text("2024-03-01T08:00:00"), Lattice::Timestamp);
        assert_eq!(classify_text("Alice"), Lattice::Str);
        assert_eq!(classify_text(""), Lattice::Unknown);
    }

    #[test]
    fn promotion_lattice() {
        assert_eq!(combine(Lattice::Bool, Lattice::Int), Lattice::Int);
        assert_eq!(combine(Lattice::Int, Lattice::Float), Lattice::Float);
        assert_eq!(combine(Lattice::Float, Lattice::Str), Lattice::Str);
        assert_eq!(combine(Lattice::Unknown, Lattice::Bool), Lattice::Bool);
        // Timestamps do not mix.
        assert_eq!(combine(Lattice::Timestamp, Lattice::Int), Lattice::Str);
        assert_eq!(
            combine(Lattice::Timestamp, Lattice::Timestamp),
            Lattice::Timestamp
        );
    }

    #[test]
    fn unknown_column_falls_back_to_string() {
        assert_eq!(to_value_type(Lattice::Unknown), ValueType::String);
    }

    #[test]
    fn naive_timestamps_read_as_utc() {
        assert_eq!(
            parse_timestamp_micros("2024-03-01T08:00:00"),
            parse_timestamp_micros("2024-03-01T08:00:00Z"),
        );
        assert_eq!(
            parse_timestamp_micros("2024-03-01T08:00:00+02:00"),
            parse_timestamp_micros("2024-03-01T06:00:00Z"),
        );
    }
}
