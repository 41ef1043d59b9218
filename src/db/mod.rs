//! Database driver abstraction for db-conduit.
//!
//! The driver is an opaque capability: it connects, closes, runs a
//! result-returning call and a no-result call, and may report the state of
//! its transport. Everything above this module works against the traits
//! defined here.

mod mock;
mod postgres;
mod types;

pub use mock::{CallKind, MockBackend, MockCall, MockDriver, MockDriverFactory, MockResultSet};
pub use postgres::{PostgresDriver, PostgresDriverFactory};
pub use types::{ColumnMetadata, QueryResult, Row, Value, GENERIC_TEXT_TYPE};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Liveness of a driver's transport, as far as the driver can tell locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Still handshaking.
    Connecting,
    /// Ready for requests.
    Open,
    /// Shutdown in progress.
    Closing,
    /// Gone.
    Closed,
}

impl TransportState {
    /// Returns true only for a transport ready to carry requests.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Column description as reported by a typed driver result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    pub data_type: Option<String>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub size: Option<u64>,
}

impl RawColumn {
    pub fn new(name: impl Into<String>, data_type: Option<&str>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.map(String::from),
            ..Self::default()
        }
    }
}

/// A typed driver result exposing row and column accessors.
pub trait TabularResponse: Send + Sync {
    /// Column descriptions in result order.
    fn columns(&self) -> Vec<RawColumn>;

    /// Number of rows available.
    fn row_count(&self) -> usize;

    /// Values of the row at `index`, parallel to `columns()`.
    fn row(&self, index: usize) -> Vec<Value>;
}

/// What a driver hands back from either call path.
pub enum RawResponse {
    /// An object with accessor methods.
    Typed(Box<dyn TabularResponse>),
    /// A raw protocol envelope with a status field and result entries.
    Envelope(serde_json::Value),
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Typed(t) => f
                .debug_struct("Typed")
                .field("rows", &t.row_count())
                .finish(),
            Self::Envelope(v) => f.debug_tuple("Envelope").field(v).finish(),
        }
    }
}

/// Everything a factory needs to open a handle for one connection record.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Schema to open once connected.
    pub schema: Option<String>,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "******"))
            .field("schema", &self.schema)
            .finish()
    }
}

/// An open logical connection to the database.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Runs a statement through the result-returning call path.
    async fn query(&self, sql: &str) -> Result<RawResponse>;

    /// Runs a statement through the no-result call path.
    async fn execute(&self, sql: &str) -> Result<RawResponse>;

    /// Runs the liveness round trip. Drivers without a dedicated path send it
    /// through `query`.
    async fn probe(&self, sql: &str) -> Result<RawResponse> {
        self.query(sql).await
    }

    /// Local view of transport liveness. `None` when the driver cannot tell
    /// without a round trip. A handle with a statement in flight is `Open`.
    fn transport_state(&self) -> Option<TransportState> {
        None
    }

    /// Closes the connection.
    async fn close(&self) -> Result<()>;
}

/// Opens driver handles.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn DatabaseDriver>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_open_is_open() {
        assert!(TransportState::Open.is_open());
        assert!(!TransportState::Connecting.is_open());
        assert!(!TransportState::Closing.is_open());
        assert!(!TransportState::Closed.is_open());
    }

    #[test]
    fn test_connect_params_debug_masks_password() {
        let params = ConnectParams {
            host: "h".to_string(),
            port: 1,
            user: "u".to_string(),
            password: Some("hunter2".to_string()),
            schema: None,
        };
        let debug = format!("{params:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("******"));
    }
}
