//! Error types for db-conduit.
//!
//! Defines the main error enum used throughout the crate.

use thiserror::Error;

/// Main error type for db-conduit operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConduitError {
    /// No active connection, or an unknown connection id was referenced.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The connectivity test run by add/update failed.
    #[error("Connection test failed: {0}")]
    ConnectionTest(String),

    /// Transport-level failures (reset sockets, refused connections, timeouts).
    #[error("Connection error: {0}")]
    Connection(String),

    /// Driver-reported SQL errors (syntax errors, missing objects, permissions).
    #[error("Query error: {0}")]
    Query(String),

    /// The caller cancelled the query.
    #[error("Query cancelled")]
    Cancelled,

    /// Secret or metadata store failures.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Internal errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConduitError {
    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a connection test error with the given message.
    pub fn connection_test(msg: impl Into<String>) -> Self {
        Self::ConnectionTest(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates a persistence error with the given message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The "no active connection" configuration error.
    pub fn no_active_connection() -> Self {
        Self::config("no active connection")
    }

    /// The configuration error for an id the registry does not know.
    pub fn unknown_connection(id: &str) -> Self {
        Self::config(format!("unknown connection '{id}'"))
    }

    /// Returns the message as reported, without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Config(msg)
            | Self::ConnectionTest(msg)
            | Self::Connection(msg)
            | Self::Query(msg)
            | Self::Persistence(msg)
            | Self::Internal(msg) => msg,
            Self::Cancelled => "Query cancelled",
        }
    }

    /// Returns true if this is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if the error is eligible for one automatic retry.
    pub fn is_transient(&self) -> bool {
        crate::connection::retry::is_transient(self)
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "Configuration Error",
            Self::ConnectionTest(_) => "Connection Test Error",
            Self::Connection(_) => "Connection Error",
            Self::Query(_) => "Query Error",
            Self::Cancelled => "Cancelled",
            Self::Persistence(_) => "Persistence Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using ConduitError.
pub type Result<T> = std::result::Result<T, ConduitError>;
