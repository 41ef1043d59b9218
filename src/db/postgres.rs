//! PostgreSQL driver implementation.
//!
//! Provides `PostgresDriver`, a single sqlx `PgConnection` wrapped as a
//! [`DatabaseDriver`] handle. Queries come back as typed result sets;
//! commands come back as a protocol envelope carrying the affected-row count.

use crate::db::{
    ConnectParams, DatabaseDriver, DriverFactory, RawColumn, RawResponse, TabularResponse,
    TransportState, Value,
};
use crate::error::{ConduitError, Result};
use async_trait::async_trait;
use serde_json::json;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column as SqlxColumn, Connection, Executor, Row as SqlxRow, Statement, TypeInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Opens [`PostgresDriver`] handles.
#[derive(Debug, Default, Clone)]
pub struct PostgresDriverFactory;

impl PostgresDriverFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DriverFactory for PostgresDriverFactory {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn DatabaseDriver>> {
        let driver = PostgresDriver::connect(params).await?;
        Ok(Arc::new(driver))
    }
}

/// A single PostgreSQL connection.
#[derive(Debug)]
pub struct PostgresDriver {
    conn: Mutex<Option<PgConnection>>,
    /// Set once an I/O-level failure was observed on this connection.
    broken: AtomicBool,
}

impl PostgresDriver {
    /// Connects using the given parameters.
    pub async fn connect(params: &ConnectParams) -> Result<Self> {
        let mut options = PgConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.user);
        if let Some(password) = &params.password {
            options = options.password(password);
        }
        if let Some(schema) = &params.schema {
            options = options.options([("search_path", schema.as_str())]);
        }

        let conn = PgConnection::connect_with(&options)
            .await
            .map_err(|e| map_connection_error(e, params))?;
        debug!("Connected to {}:{}", params.host, params.port);

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            broken: AtomicBool::new(false),
        })
    }

    /// Maps a sqlx error raised by a statement, remembering transport failures.
    fn map_statement_error(&self, error: sqlx::Error) -> ConduitError {
        match error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => {
                warn!("Transport failure on connection: {error}");
                self.broken.store(true, Ordering::SeqCst);
                ConduitError::connection(error.to_string())
            }
            other => ConduitError::query(format_query_error(other)),
        }
    }

    /// Column metadata for a statement that returned no rows.
    async fn describe_columns(conn: &mut PgConnection, sql: &str) -> Vec<RawColumn> {
        match conn.prepare(sql).await {
            Ok(statement) => statement.columns().iter().map(raw_column).collect(),
            Err(e) => {
                debug!("Could not describe empty result columns: {e}");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    async fn query(&self, sql: &str) -> Result<RawResponse> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| ConduitError::connection("connection closed"))?;

        let rows: Vec<PgRow> = sqlx::query(sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| self.map_statement_error(e))?;

        let columns = match rows.first() {
            Some(first) => first.columns().iter().map(raw_column).collect(),
            None => Self::describe_columns(conn, sql).await,
        };
        let rows = rows.iter().map(convert_row).collect();

        Ok(RawResponse::Typed(Box::new(PgResultSet { columns, rows })))
    }

    async fn execute(&self, sql: &str) -> Result<RawResponse> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| ConduitError::connection("connection closed"))?;

        let outcome = conn
            .execute(sqlx::raw_sql(sql))
            .await
            .map_err(|e| self.map_statement_error(e))?;

        Ok(RawResponse::Envelope(json!({
            "status": "ok",
            "responseData": {
                "numResults": 1,
                "results": [{ "resultType": "rowCount", "rowCount": outcome.rows_affected() }]
            }
        })))
    }

    fn transport_state(&self) -> Option<TransportState> {
        if self.broken.load(Ordering::SeqCst) {
            return Some(TransportState::Closed);
        }
        // A statement in flight holds the lock, and the connection was usable
        // when it started. A failure there sets `broken`.
        match self.conn.try_lock() {
            Ok(guard) if guard.is_none() => Some(TransportState::Closed),
            Ok(_) => None,
            Err(_) => Some(TransportState::Open),
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close()
                .await
                .map_err(|e| ConduitError::connection(e.to_string()))?;
        }
        Ok(())
    }
}

/// Typed result set backed by converted PostgreSQL rows.
struct PgResultSet {
    columns: Vec<RawColumn>,
    rows: Vec<Vec<Value>>,
}

impl TabularResponse for PgResultSet {
    fn columns(&self) -> Vec<RawColumn> {
        self.columns.clone()
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn row(&self, index: usize) -> Vec<Value> {
        self.rows.get(index).cloned().unwrap_or_default()
    }
}

fn raw_column(col: &sqlx::postgres::PgColumn) -> RawColumn {
    RawColumn::new(col.name(), Some(col.type_info().name()))
}

/// Converts a PostgreSQL row to a list of values.
fn convert_row(row: &PgRow) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single PostgreSQL value based on its type name.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Maps sqlx connection errors to user-facing messages.
fn map_connection_error(error: sqlx::Error, params: &ConnectParams) -> ConduitError {
    let host = &params.host;
    let port = params.port;
    let user = &params.user;

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        ConduitError::connection(format!(
            "Cannot connect to {host}:{port}: connection refused. Check that the server is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        ConduitError::connection(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        ConduitError::connection(format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        ConduitError::connection(error.to_string())
    }
}

/// Formats a query error, keeping the server's message first.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = db_error.message().to_string();
    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }
        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }
    }
    result
}
