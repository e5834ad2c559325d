//! Normalized, dialect-agnostic column values.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::position::UniqueKeyValue;

/// A column value after normalization by a
/// [`ColumnValueReader`](crate::reader::ColumnValueReader).
///
/// Values own their data; nothing here refers back to a live cursor.
/// Decimals keep their exact textual form so no precision is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// 1-byte signed integer.
    Int8(i8),
    /// 2-byte signed integer.
    Int16(i16),
    /// 4-byte signed integer.
    Int32(i32),
    /// 8-byte signed integer.
    Int64(i64),
    /// Exact decimal in canonical text form (e.g. `"-12.3400"`).
    Decimal(String),
    /// Single precision float.
    Float32(f32),
    /// Double precision float.
    Float64(f64),
    /// Calendar date.
    Date(NaiveDate),
    /// Time of day.
    Time(NaiveTime),
    /// Timestamp without time zone.
    Timestamp(NaiveDateTime),
    /// Character data of any width or national variant.
    Text(String),
    /// Binary data of any length.
    Bytes(Vec<u8>),
}

impl ColumnValue {
    /// Returns `true` for [`ColumnValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Converts this value into a range-scan key, if its kind allows it.
    ///
    /// Integer widths collapse to [`UniqueKeyValue::Integer`] and text
    /// becomes [`UniqueKeyValue::Text`]. Everything else, including null,
    /// yields `None`.
    #[must_use]
    pub fn to_unique_key(&self) -> Option<UniqueKeyValue> {
        match self {
            Self::Int8(v) => Some(UniqueKeyValue::Integer(i64::from(*v))),
            Self::Int16(v) => Some(UniqueKeyValue::Integer(i64::from(*v))),
            Self::Int32(v) => Some(UniqueKeyValue::Integer(i64::from(*v))),
            Self::Int64(v) => Some(UniqueKeyValue::Integer(*v)),
            Self::Text(v) => Some(UniqueKeyValue::Text(v.clone())),
            _ => None,
        }
    }

    /// Compares two values the way a consistency check does.
    ///
    /// Identical to `==` except that decimals compare by numeric value
    /// (`1.50` equals `1.5`) and integer widths compare by value.
    #[must_use]
    pub fn content_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Decimal(a), Self::Decimal(b)) => {
                normalize_decimal(a) == normalize_decimal(b)
            }
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v) => Some(i64::from(*v)),
            Self::Int16(v) => Some(i64::from(*v)),
            Self::Int32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<UniqueKeyValue> for ColumnValue {
    fn from(key: UniqueKeyValue) -> Self {
        match key {
            UniqueKeyValue::Integer(v) => Self::Int64(v),
            UniqueKeyValue::Text(v) => Self::Text(v),
        }
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int8(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Decimal(v) | Self::Text(v) => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{v}"),
            Self::Time(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "{v}"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// Strips a leading `+`, leading integer zeros and trailing fraction zeros.
fn normalize_decimal(raw: &str) -> String {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let is_zero = int_part == "0" && frac_part.is_empty();
    let mut out = String::with_capacity(raw.len());
    if negative && !is_zero {
        out.push('-');
    }
    out.push_str(int_part);
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(frac_part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widths_become_integer_keys() {
        assert_eq!(
            ColumnValue::Int8(-3).to_unique_key(),
            Some(UniqueKeyValue::Integer(-3))
        );
        assert_eq!(
            ColumnValue::Int64(3_000_000_000).to_unique_key(),
            Some(UniqueKeyValue::Integer(3_000_000_000))
        );
        assert_eq!(
            ColumnValue::Text("a".into()).to_unique_key(),
            Some(UniqueKeyValue::Text("a".into()))
        );
        assert_eq!(ColumnValue::Null.to_unique_key(), None);
        assert_eq!(ColumnValue::Float64(1.0).to_unique_key(), None);
    }

    #[test]
    fn test_decimal_content_eq() {
        let a = ColumnValue::Decimal("1.50".into());
        let b = ColumnValue::Decimal("001.5".into());
        assert!(a.content_eq(&b));
        assert!(ColumnValue::Decimal("-0.00".into()).content_eq(&ColumnValue::Decimal("0".into())));
        assert!(!a.content_eq(&ColumnValue::Decimal("1.05".into())));
    }

    #[test]
    fn test_integer_widths_content_eq() {
        assert!(ColumnValue::Int32(7).content_eq(&ColumnValue::Int64(7)));
        assert!(!ColumnValue::Int32(7).content_eq(&ColumnValue::Text("7".into())));
    }

    #[test]
    fn test_serde_tagged_form() {
        let v = ColumnValue::Int32(42);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"type":"int32","value":42}"#);
        let null = serde_json::to_string(&ColumnValue::Null).unwrap();
        assert_eq!(null, r#"{"type":"null"}"#);
    }
}
