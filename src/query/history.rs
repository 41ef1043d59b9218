//! Query history.
//!
//! A bounded list of executed statements kept under one metadata key,
//! oldest first. Appending past the bound drops the oldest entries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::persistence::{get_json, set_json, MetadataStore};

/// Metadata key holding the history list.
pub const HISTORY_KEY: &str = "query_history";

/// Who submitted the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmittedBy {
    User,
    /// Round-trip validation probe issued by the registry.
    Probe,
}

/// Query execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Success,
    Error,
    Cancelled,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A query history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub connection_id: String,
    pub submitted_by: SubmittedBy,
    pub sql: String,
    pub status: QueryStatus,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// A new entry stamped with the current time.
    pub fn new(
        connection_id: impl Into<String>,
        submitted_by: SubmittedBy,
        sql: impl Into<String>,
        status: QueryStatus,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            submitted_by,
            sql: sql.into(),
            status,
            execution_time_ms: None,
            row_count: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

/// Filter options for listing history.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub connection_id: Option<String>,
    /// Case-insensitive substring of the SQL text.
    pub text_search: Option<String>,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    fn matches(&self, entry: &HistoryEntry) -> bool {
        if let Some(id) = &self.connection_id {
            if &entry.connection_id != id {
                return false;
            }
        }
        if let Some(text) = &self.text_search {
            if !entry.sql.to_lowercase().contains(&text.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Bounded query history persisted in a metadata store.
pub struct QueryHistory {
    store: Arc<dyn MetadataStore>,
    max_entries: usize,
    /// Serializes read-modify-write cycles on the history key.
    write_lock: Mutex<()>,
}

impl QueryHistory {
    pub fn new(store: Arc<dyn MetadataStore>, max_entries: usize) -> Self {
        Self {
            store,
            max_entries,
            write_lock: Mutex::new(()),
        }
    }

    /// Appends an entry, trimming the oldest past the bound.
    pub async fn record(&self, entry: HistoryEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        entries.push(entry);

        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
            debug!("Trimmed {excess} history entries");
        }

        set_json(self.store.as_ref(), HISTORY_KEY, &entries).await
    }

    /// Lists entries newest first.
    pub async fn list(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
        let entries = self.load().await?;
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(entries
            .into_iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .collect())
    }

    /// Removes every entry.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.delete(HISTORY_KEY).await
    }

    async fn load(&self) -> Result<Vec<HistoryEntry>> {
        Ok(get_json(self.store.as_ref(), HISTORY_KEY)
            .await?
            .unwrap_or_default())
    }
}
