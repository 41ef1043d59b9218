//! Query result types for db-conduit.
//!
//! Defines the uniform result shape every driver response is normalized into.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type reported for columns whose driver gave no type information.
pub const GENERIC_TEXT_TYPE: &str = "VARCHAR";

/// Represents the result of executing a SQL statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Column names, in result order.
    pub columns: Vec<String>,

    /// Column type metadata, parallel to `columns`.
    pub column_metadata: Vec<ColumnMetadata>,

    /// Rows keyed by column name.
    pub rows: Vec<Row>,

    /// Number of rows returned, or rows affected for commands.
    pub row_count: usize,

    /// Wall time of the driver call, in milliseconds.
    pub execution_time_ms: u64,

    /// Whether rows were cut off by a fetch cap.
    #[serde(default)]
    pub was_truncated: bool,
}

impl QueryResult {
    /// Creates a new empty query result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the result set is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns true if the statement produced a tabular result.
    pub fn is_tabular(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Returns a truncation warning message if the result was truncated.
    pub fn truncation_warning(&self) -> Option<String> {
        self.was_truncated
            .then(|| format!("Result truncated: showing first {} rows", self.row_count))
    }
}

/// Metadata about a column in a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    /// Column name.
    pub name: String,

    /// Column data type. Always present.
    #[serde(rename = "type")]
    pub data_type: String,

    /// Numeric precision, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,

    /// Numeric scale, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,

    /// Character or binary size, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl ColumnMetadata {
    /// Creates column metadata with the given name and type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            ..Self::default()
        }
    }

    /// Creates column metadata, substituting the generic text type when absent.
    pub fn with_optional_type(name: impl Into<String>, data_type: Option<String>) -> Self {
        Self::new(
            name,
            data_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| GENERIC_TEXT_TYPE.to_string()),
        )
    }
}

/// A row of data, keyed by column name in result order.
pub type Row = IndexMap<String, Value>;

/// Represents a single value from a database query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed integer (up to i64).
    Int(i64),

    /// Floating point number.
    Float(f64),

    /// Text/string value.
    String(String),

    /// Binary data.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Attempts to convert the value to a string representation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Null.to_display_string(), "NULL");
        assert_eq!(Value::Bool(true).to_display_string(), "true");
        assert_eq!(Value::Int(42).to_display_string(), "42");
        assert_eq!(Value::Float(2.71).to_display_string(), "2.71");
        assert_eq!(Value::from("hello").to_display_string(), "hello");
        assert_eq!(Value::Bytes(vec![1, 2, 3]).to_display_string(), "<3 bytes>");
    }

    #[test]
    fn test_value_from_json() {
        assert_eq!(Value::from(&json!(null)), Value::Null);
        assert_eq!(Value::from(&json!(7)), Value::Int(7));
        assert_eq!(Value::from(&json!(1.5)), Value::Float(1.5));
        assert_eq!(Value::from(&json!("x")), Value::from("x"));
        assert_eq!(Value::from(&json!(false)), Value::Bool(false));
        assert_eq!(Value::from(&json!([1, 2])), Value::from("[1,2]"));
    }

    #[test]
    fn test_value_from_option() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some(42i32)), Value::Int(42));
    }

    #[test]
    fn test_value_serializes_untagged() {
        let mut row = Row::new();
        row.insert("id".to_string(), Value::Int(1));
        row.insert("name".to_string(), Value::Null);
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"id":1,"name":null}"#
        );
    }

    #[test]
    fn test_column_metadata_defaults_to_text_type() {
        let col = ColumnMetadata::with_optional_type("A", None);
        assert_eq!(col.data_type, GENERIC_TEXT_TYPE);
        let col = ColumnMetadata::with_optional_type("B", Some("DECIMAL".to_string()));
        assert_eq!(col.data_type, "DECIMAL");
    }

    #[test]
    fn test_truncation_warning() {
        let mut result = QueryResult::new();
        assert!(result.truncation_warning().is_none());
        result.row_count = 10;
        result.was_truncated = true;
        assert_eq!(
            result.truncation_warning().unwrap(),
            "Result truncated: showing first 10 rows"
        );
    }
}
