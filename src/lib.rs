//! db-conduit - connection lifecycle and resilient query execution.
//!
//! This library exposes the core modules for use by the CLI and in
//! integration tests.

pub mod classify;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod query;
