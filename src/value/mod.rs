//! Column values and row stringification
//!
//! Rows arrive from a [`RowSource`](crate::source::RowSource) as typed
//! [`Value`]s and leave as plain text fields ready for the CSV encoder.
//! An optional [`RowFilter`] hook runs between the two, letting callers
//! drop or rewrite rows before they reach the output.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A single column value as produced by a row source.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Render this value as a CSV field.
    ///
    /// Nulls become empty fields, byte arrays are decoded as text, and
    /// timestamps honor `time_format` (a chrono format string) when set,
    /// falling back to RFC 3339.
    pub fn to_field(&self, time_format: Option<&str>) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Uint(u) => u.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Timestamp(t) => match time_format {
                Some(fmt) => t.format(fmt).to_string(),
                None => t.to_rfc3339(),
            },
        }
    }
}

/// Hook invoked for every stringified row before it is written.
///
/// Receives the row and the column names; returns whether to keep the row
/// and the (possibly rewritten) row. Skipped rows do not count toward the
/// exported row total. The hook must not change the number of columns.
pub type RowFilter =
    Arc<dyn Fn(Vec<String>, &[String]) -> (bool, Vec<String>) + Send + Sync>;

/// Convert a scanned row of typed values into text fields.
pub fn stringify_row(values: &[Value], time_format: Option<&str>) -> Vec<String> {
    values.iter().map(|v| v.to_field(time_format)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_null_is_empty_field() {
        assert_eq!(Value::Null.to_field(None), "");
    }

    #[test]
    fn test_bool_fields() {
        assert_eq!(Value::Bool(true).to_field(None), "true");
        assert_eq!(Value::Bool(false).to_field(None), "false");
    }

    #[test]
    fn test_integer_fields() {
        assert_eq!(Value::Int(-42).to_field(None), "-42");
        assert_eq!(Value::Uint(18_446_744_073_709_551_615).to_field(None), "18446744073709551615");
    }

    #[test]
    fn test_bytes_decoded_as_text() {
        assert_eq!(Value::Bytes(b"hello".to_vec()).to_field(None), "hello");
    }

    #[test]
    fn test_timestamp_with_format() {
        let t = Utc.with_ymd_and_hms(2023, 7, 14, 9, 30, 0).unwrap();
        let v = Value::Timestamp(t);
        assert_eq!(v.to_field(Some("%Y-%m-%d")), "2023-07-14");
        assert_eq!(v.to_field(None), "2023-07-14T09:30:00+00:00");
    }

    #[test]
    fn test_stringify_row() {
        let row = vec![Value::Null, Value::Int(7), Value::Text("x".into())];
        assert_eq!(stringify_row(&row, None), vec!["", "7", "x"]);
    }
}
