//! Connection management for db-conduit.
//!
//! Centralizes connection records, handle lifecycle, and retry.

pub mod registry;
pub mod retry;

pub use registry::{ConnectionRecord, ConnectionRegistry, RegistryEvent};
pub use retry::{is_transient, TransientPattern, RETRY_DELAY, TRANSIENT_PATTERNS};
