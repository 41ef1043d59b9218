//! Converts raw driver responses into the uniform result shape.
//!
//! Drivers hand back either a typed object with row and column accessors or
//! a protocol envelope:
//!
//! ```json
//! {"status":"ok","responseData":{"numResults":1,"results":[
//!   {"resultType":"resultSet","resultSet":{"numColumns":1,"numRows":2,
//!     "columns":[{"name":"A","dataType":{"type":"DECIMAL","precision":18,"scale":0}}],
//!     "data":[[1,2]]}}]}}
//! ```
//!
//! Envelope data is column-major. Only the first result entry is used.

use serde::Deserialize;

use crate::db::{ColumnMetadata, QueryResult, RawResponse, Row, TabularResponse, Value};
use crate::error::{ConduitError, Result};

/// A normalized response, before timing is attached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<Row>,
    /// Affected-row count reported by a non-tabular result.
    pub affected_rows: Option<u64>,
}

impl Normalized {
    /// Builds the final result. With neither columns nor rows, the row count
    /// is the affected-row count.
    pub fn into_query_result(self, execution_time_ms: u64) -> QueryResult {
        let row_count = if self.columns.is_empty() && self.rows.is_empty() {
            self.affected_rows.unwrap_or(0) as usize
        } else {
            self.rows.len()
        };

        QueryResult {
            columns: self.columns.iter().map(|c| c.name.clone()).collect(),
            column_metadata: self.columns,
            rows: self.rows,
            row_count,
            execution_time_ms,
            was_truncated: false,
        }
    }
}

/// Normalizes either response form.
pub fn normalize(response: RawResponse) -> Result<Normalized> {
    match response {
        RawResponse::Typed(typed) => Ok(normalize_typed(typed.as_ref())),
        RawResponse::Envelope(value) => normalize_envelope(value),
    }
}

fn normalize_typed(response: &dyn TabularResponse) -> Normalized {
    let columns: Vec<ColumnMetadata> = response
        .columns()
        .into_iter()
        .map(|raw| ColumnMetadata {
            precision: raw.precision,
            scale: raw.scale,
            size: raw.size,
            ..ColumnMetadata::with_optional_type(raw.name, raw.data_type)
        })
        .collect();

    let rows = (0..response.row_count())
        .map(|index| {
            let mut values = response.row(index).into_iter();
            columns
                .iter()
                .map(|c| (c.name.clone(), values.next().unwrap_or_default()))
                .collect()
        })
        .collect();

    Normalized {
        columns,
        rows,
        affected_rows: None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    status: String,
    #[serde(default)]
    response_data: Option<ResponseData>,
    #[serde(default)]
    exception: Option<ExceptionInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseData {
    #[serde(default)]
    results: Vec<ResultEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultEntry {
    result_type: String,
    #[serde(default)]
    result_set: Option<ResultSet>,
    #[serde(default)]
    row_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSet {
    #[serde(default)]
    num_rows: Option<usize>,
    #[serde(default)]
    columns: Vec<EnvelopeColumn>,
    #[serde(default)]
    data: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeColumn {
    name: String,
    #[serde(default)]
    data_type: Option<DataType>,
}

#[derive(Debug, Default, Deserialize)]
struct DataType {
    #[serde(rename = "type", default)]
    type_name: Option<String>,
    #[serde(default)]
    precision: Option<u32>,
    #[serde(default)]
    scale: Option<u32>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionInfo {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    sql_code: Option<String>,
}

fn normalize_envelope(value: serde_json::Value) -> Result<Normalized> {
    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|e| ConduitError::query(format!("Malformed driver response: {e}")))?;

    match envelope.status.as_str() {
        "ok" => {}
        "error" => {
            let exception = envelope.exception.unwrap_or(ExceptionInfo {
                text: None,
                sql_code: None,
            });
            if let Some(code) = &exception.sql_code {
                tracing::debug!("Driver reported SQL error code {code}");
            }
            return Err(ConduitError::query(
                exception
                    .text
                    .unwrap_or_else(|| "Unknown database error".to_string()),
            ));
        }
        other => {
            return Err(ConduitError::query(format!(
                "Malformed driver response: unexpected status '{other}'"
            )))
        }
    }

    let Some(first) = envelope
        .response_data
        .and_then(|data| data.results.into_iter().next())
    else {
        return Ok(Normalized::default());
    };

    match (first.result_type.as_str(), first.result_set) {
        ("resultSet", Some(set)) => Ok(transpose(set)),
        _ => Ok(Normalized {
            affected_rows: first.row_count,
            ..Normalized::default()
        }),
    }
}

/// Turns column-major data into name-keyed rows.
fn transpose(set: ResultSet) -> Normalized {
    let columns: Vec<ColumnMetadata> = set
        .columns
        .into_iter()
        .map(|column| {
            let data_type = column.data_type.unwrap_or_default();
            ColumnMetadata {
                precision: data_type.precision,
                scale: data_type.scale,
                size: data_type.size,
                ..ColumnMetadata::with_optional_type(column.name, data_type.type_name)
            }
        })
        .collect();

    // `numRows` counts the whole result; `data` may carry only its first chunk.
    let available = set.data.iter().map(Vec::len).max().unwrap_or(0);
    let num_rows = set.num_rows.map_or(available, |n| n.min(available));

    let rows = (0..num_rows)
        .map(|r| {
            columns
                .iter()
                .enumerate()
                .map(|(c, column)| {
                    let value = set
                        .data
                        .get(c)
                        .and_then(|values| values.get(r))
                        .map(Value::from)
                        .unwrap_or_default();
                    (column.name.clone(), value)
                })
                .collect()
        })
        .collect();

    Normalized {
        columns,
        rows,
        affected_rows: None,
    }
}
