use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;

/// A single bound parameter value.
///
/// The wire protocol takes parameters in libpq text form, so every variant
/// knows how to render itself as text; `Null` crosses the seam as the absent
/// value.
///
/// ```rust
/// use enigma_pool::ParamValue;
///
/// let params = vec![
///     ParamValue::Int(1),
///     ParamValue::Text("alice".into()),
///     ParamValue::Bool(true),
/// ];
/// # let _ = params;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Timestamp value
    Timestamp(NaiveDateTime),
    /// JSON value
    Json(JsonValue),
    /// Binary data, rendered in bytea hex form
    Bytes(Vec<u8>),
}

impl ParamValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        if let ParamValue::Int(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let ParamValue::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        if let ParamValue::Bool(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    /// Render to the libpq text format, `None` standing in for NULL.
    #[must_use]
    pub fn to_wire_text(&self) -> Option<String> {
        match self {
            ParamValue::Null => None,
            ParamValue::Bool(b) => Some(if *b { "t".to_string() } else { "f".to_string() }),
            ParamValue::Int(i) => Some(i.to_string()),
            ParamValue::Float(f) => Some(f.to_string()),
            ParamValue::Text(s) => Some(s.clone()),
            ParamValue::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            ParamValue::Json(v) => Some(v.to_string()),
            ParamValue::Bytes(bytes) => {
                let mut out = String::with_capacity(2 + bytes.len() * 2);
                out.push_str("\\x");
                for b in bytes {
                    let _ = write!(out, "{b:02x}");
                }
                Some(out)
            }
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

/// Caller-side parameter binding: a positional sequence for `?` queries or a
/// name→value map for `:name` queries.
#[derive(Debug, Clone, Default)]
pub enum QueryParams {
    /// No parameters.
    #[default]
    None,
    /// Positional values, bound in order.
    Positional(Vec<ParamValue>),
    /// Named values, bound through the query's name map.
    Named(HashMap<String, ParamValue>),
}

impl QueryParams {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            QueryParams::None => 0,
            QueryParams::Positional(values) => values.len(),
            QueryParams::Named(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<ParamValue>> for QueryParams {
    fn from(values: Vec<ParamValue>) -> Self {
        QueryParams::Positional(values)
    }
}

impl From<HashMap<String, ParamValue>> for QueryParams {
    fn from(values: HashMap<String, ParamValue>) -> Self {
        QueryParams::Named(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_text_rendering() {
        assert_eq!(ParamValue::Null.to_wire_text(), None);
        assert_eq!(ParamValue::Bool(true).to_wire_text().unwrap(), "t");
        assert_eq!(ParamValue::Bool(false).to_wire_text().unwrap(), "f");
        assert_eq!(ParamValue::Int(-7).to_wire_text().unwrap(), "-7");
        assert_eq!(
            ParamValue::Bytes(vec![0xde, 0xad]).to_wire_text().unwrap(),
            "\\xdead"
        );
    }

    #[test]
    fn timestamp_rendering() {
        let ts = NaiveDateTime::parse_from_str("2024-01-01 08:00:01", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(
            ParamValue::Timestamp(ts).to_wire_text().unwrap(),
            "2024-01-01 08:00:01"
        );
    }
}
