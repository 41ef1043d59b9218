//! Query execution.
//!
//! Classifies each statement to pick the driver call path, enforces the
//! row ceiling, dispatches through the registry's retry choke point, and
//! honors cooperative cancellation before and after the driver call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::history::{HistoryEntry, QueryHistory, QueryStatus, SubmittedBy};
use super::normalizer::{normalize, Normalized};
use crate::classify::{append_row_limit, classify_sql, schema_switch, StatementKind};
use crate::config::ExecutionConfig;
use crate::connection::ConnectionRegistry;
use crate::db::QueryResult;
use crate::error::{ConduitError, Result};

/// The call currently in flight, if any.
struct InFlight {
    seq: u64,
    token: CancellationToken,
}

/// Keeps a call's token reachable from `cancel_current_query` until dropped.
struct Registration<'a> {
    current: &'a Mutex<Option<InFlight>>,
    seq: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut current = lock(self.current);
        // A newer call may have replaced this one.
        if current.as_ref().is_some_and(|c| c.seq == self.seq) {
            *current = None;
        }
    }
}

/// Runs SQL against the active connection.
pub struct QueryExecutor {
    registry: Arc<ConnectionRegistry>,
    config: ExecutionConfig,
    history: Option<Arc<QueryHistory>>,
    current: Mutex<Option<InFlight>>,
    next_seq: AtomicU64,
}

impl QueryExecutor {
    pub fn new(registry: Arc<ConnectionRegistry>, config: &ExecutionConfig) -> Self {
        Self {
            registry,
            config: config.clone(),
            history: None,
            current: Mutex::new(None),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Records every execution in the given history.
    pub fn with_history(mut self, history: Arc<QueryHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Advisory upper bound on a single query. Callers enforce it by calling
    /// [`cancel_current_query`](Self::cancel_current_query).
    pub fn query_timeout(&self) -> Duration {
        self.config.query_timeout()
    }

    /// Executes a statement on the active connection.
    ///
    /// Projecting statements without their own ceiling get
    /// `LIMIT max_result_rows` appended. The call is cancellable from its
    /// first poll; the token is checked once the driver is obtained and again
    /// once the driver call returns.
    pub async fn execute(
        &self,
        sql: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<QueryResult> {
        let token = cancel.unwrap_or_default();
        let _registration = self.register(token.clone());

        let id = self
            .registry
            .active_connection_id()
            .await
            .ok_or_else(ConduitError::no_active_connection)?;

        let statement = normalize_statement(sql)?;
        let classification = classify_sql(&statement);
        let sent = if classification.needs_row_limit() {
            append_row_limit(&statement, self.config.max_result_rows)
        } else {
            statement.clone()
        };
        debug!(
            "Executing {} statement (leading keyword: {:?})",
            classification.kind, classification.leading_keyword
        );

        let result = self
            .run(&id, &sent, classification.kind, &token)
            .await
            .map(|(normalized, elapsed_ms)| normalized.into_query_result(elapsed_ms));

        if result.is_ok() {
            if let Some(schema) = schema_switch(&statement) {
                if let Err(e) = self.registry.set_session_schema(&id, &schema).await {
                    warn!("Failed to record session schema: {e}");
                }
            }
        }

        self.record_history(&id, &statement, &result).await;
        result
    }

    /// Runs a read through the result-returning path and caps the returned
    /// rows instead of rewriting the SQL.
    pub async fn execute_and_fetch(&self, sql: &str, limit: Option<usize>) -> Result<QueryResult> {
        let token = CancellationToken::new();
        let _registration = self.register(token.clone());

        let id = self
            .registry
            .active_connection_id()
            .await
            .ok_or_else(ConduitError::no_active_connection)?;

        let statement = normalize_statement(sql)?;
        let cap = limit.unwrap_or(self.config.max_result_rows);

        let result = self
            .run(&id, &statement, StatementKind::Projecting, &token)
            .await
            .map(|(normalized, elapsed_ms)| {
                let mut result = normalized.into_query_result(elapsed_ms);
                if result.rows.len() > cap {
                    result.rows.truncate(cap);
                    result.row_count = cap;
                    result.was_truncated = true;
                }
                result
            });

        self.record_history(&id, &statement, &result).await;
        result
    }

    /// Cancels the in-flight call, if there is one.
    pub fn cancel_current_query(&self) -> bool {
        match lock(&self.current).as_ref() {
            Some(in_flight) if !in_flight.token.is_cancelled() => {
                in_flight.token.cancel();
                info!("Cancelled in-flight query");
                true
            }
            _ => false,
        }
    }

    /// Makes `token` the one `cancel_current_query` reaches.
    fn register(&self, token: CancellationToken) -> Registration<'_> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        *lock(&self.current) = Some(InFlight { seq, token });
        Registration {
            current: &self.current,
            seq,
        }
    }

    /// Runs the call inside the retry wrapper and reports the elapsed time.
    async fn run(
        &self,
        id: &str,
        sql: &str,
        kind: StatementKind,
        token: &CancellationToken,
    ) -> Result<(Normalized, u64)> {
        let started = Instant::now();
        let outcome = self
            .registry
            .execute_with_retry(Some(id), move || self.dispatch(id, sql, kind, token))
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        outcome.map(|normalized| (normalized, elapsed_ms))
    }

    /// One attempt: driver, first poll, call, second poll, normalize.
    async fn dispatch(
        &self,
        id: &str,
        sql: &str,
        kind: StatementKind,
        token: &CancellationToken,
    ) -> Result<Normalized> {
        let driver = self.registry.get_driver(Some(id)).await?;
        if token.is_cancelled() {
            return Err(ConduitError::Cancelled);
        }

        let response = match kind {
            StatementKind::Projecting => driver.query(sql).await,
            StatementKind::SideEffecting => driver.execute(sql).await,
        };

        if token.is_cancelled() {
            debug!("Query cancelled during driver call; dropping response");
            return Err(ConduitError::Cancelled);
        }

        normalize(response?)
    }

    async fn record_history(&self, id: &str, sql: &str, result: &Result<QueryResult>) {
        let Some(history) = &self.history else {
            return;
        };

        let entry = match result {
            Ok(r) => {
                let mut entry = HistoryEntry::new(id, SubmittedBy::User, sql, QueryStatus::Success);
                entry.execution_time_ms = Some(r.execution_time_ms);
                entry.row_count = Some(r.row_count as u64);
                entry
            }
            Err(ConduitError::Cancelled) => {
                HistoryEntry::new(id, SubmittedBy::User, sql, QueryStatus::Cancelled)
            }
            Err(e) => {
                let mut entry = HistoryEntry::new(id, SubmittedBy::User, sql, QueryStatus::Error);
                entry.error_message = Some(e.message().to_string());
                entry
            }
        };

        if let Err(e) = history.record(entry).await {
            warn!("Failed to record query history: {e}");
        }
    }
}

/// Trims whitespace and trailing statement terminators.
fn normalize_statement(sql: &str) -> Result<String> {
    let statement = sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if statement.is_empty() {
        return Err(ConduitError::query("empty statement"));
    }
    Ok(statement.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
