//! Text and JSON rendering of command results.

use db_conduit::connection::ConnectionRecord;
use db_conduit::db::QueryResult;
use db_conduit::query::HistoryEntry;
use serde::Serialize;

/// Maximum width of a rendered cell before it is cut with an ellipsis.
const MAX_CELL_WIDTH: usize = 60;

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Text
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionListing<'a> {
    active_connection_id: Option<&'a str>,
    connections: &'a [ConnectionRecord],
}

/// Formats command results.
pub struct Output {
    format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a query result.
    pub fn query_result(&self, result: &QueryResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(result),
            OutputFormat::Text => {
                if !result.is_tabular() {
                    return format!(
                        "{} row(s) affected ({} ms)",
                        result.row_count, result.execution_time_ms
                    );
                }

                let rows: Vec<Vec<String>> = result
                    .rows
                    .iter()
                    .map(|row| {
                        result
                            .columns
                            .iter()
                            .map(|column| {
                                row.get(column)
                                    .map(|value| value.to_display_string())
                                    .unwrap_or_default()
                            })
                            .collect()
                    })
                    .collect();

                let mut output = format_table(&result.columns, &rows);
                output.push_str(&format!(
                    "\n({} row(s), {} ms)",
                    result.row_count, result.execution_time_ms
                ));
                if let Some(warning) = result.truncation_warning() {
                    output.push('\n');
                    output.push_str(&warning);
                }
                output
            }
        }
    }

    /// Formats the saved connections, marking the active one.
    pub fn connections(&self, records: &[ConnectionRecord], active: Option<&str>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ConnectionListing {
                active_connection_id: active,
                connections: records,
            }),
            OutputFormat::Text => {
                if records.is_empty() {
                    return "No saved connections.".to_string();
                }
                let headers = ["", "Name", "Target", "Schema", "Id"].map(String::from);
                let rows: Vec<Vec<String>> = records
                    .iter()
                    .map(|record| {
                        let marker = if active == Some(record.id.as_str()) { "*" } else { "" };
                        vec![
                            marker.to_string(),
                            record.name.clone(),
                            record.display_string(),
                            record.default_schema.clone().unwrap_or_default(),
                            record.id.clone(),
                        ]
                    })
                    .collect();
                format_table(&headers, &rows)
            }
        }
    }

    /// Formats history entries, newest first.
    pub fn history(&self, entries: &[HistoryEntry]) -> String {
        match self.format {
            OutputFormat::Json => to_json(entries),
            OutputFormat::Text => {
                if entries.is_empty() {
                    return "No query history.".to_string();
                }
                let headers = ["When", "Status", "Time", "Rows", "SQL"].map(String::from);
                let rows: Vec<Vec<String>> = entries
                    .iter()
                    .map(|entry| {
                        vec![
                            entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                            entry.status.as_str().to_string(),
                            entry
                                .execution_time_ms
                                .map(|ms| format!("{ms} ms"))
                                .unwrap_or_default(),
                            entry.row_count.map(|n| n.to_string()).unwrap_or_default(),
                            single_line(&entry.sql),
                        ]
                    })
                    .collect();
                format_table(&headers, &rows)
            }
        }
    }

    /// Formats a one-line confirmation message.
    pub fn message(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "message": message })),
            OutputFormat::Text => message.to_string(),
        }
    }

    /// Formats a single connection record.
    pub fn connection(&self, record: &ConnectionRecord, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(record),
            OutputFormat::Text => format!("{message}: {} ({})", record.name, record.id),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"Failed to serialize: {}\"}}", e))
}

fn single_line(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(s: &str, max_width: usize) -> String {
    if s.chars().count() <= max_width {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_width.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Formats a table as a string for display.
fn format_table(headers: &[String], rows: &[Vec<String>]) -> String {
    if headers.is_empty() {
        return String::new();
    }

    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.iter().map(|cell| truncate(cell, MAX_CELL_WIDTH)).collect())
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }

    let mut output = String::new();

    let header_line: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    output.push_str(header_line.join(" │ ").trim_end());
    output.push('\n');

    let separator: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
    output.push_str(&separator.join("─┼─"));
    output.push('\n');

    for row in &rows {
        let row_line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let width = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = width)
            })
            .collect();
        output.push_str(row_line.join(" │ ").trim_end());
        output.push('\n');
    }

    output.trim_end().to_string()
}
