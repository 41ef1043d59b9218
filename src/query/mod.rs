//! Query execution, result normalization, and history for db-conduit.

pub mod executor;
pub mod history;
pub mod normalizer;

pub use executor::QueryExecutor;
pub use history::{HistoryEntry, HistoryFilter, QueryHistory, QueryStatus, SubmittedBy};
pub use normalizer::{normalize, Normalized};
