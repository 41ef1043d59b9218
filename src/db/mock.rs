//! Mock database driver for testing.
//!
//! An in-memory driver whose behavior is scripted through a shared
//! [`MockBackend`]: queued failures and responses, probe behavior, transport
//! state, and a record of every call made.

use super::{
    ConnectParams, DatabaseDriver, DriverFactory, RawColumn, RawResponse, TabularResponse,
    TransportState, Value,
};
use crate::error::{ConduitError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Which call path a recorded call went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Query,
    Execute,
    Probe,
}

/// A call observed by the mock backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub kind: CallKind,
    pub sql: String,
    pub handle: usize,
}

type CallHook = Box<dyn Fn(&str) + Send + Sync>;

/// Shared script and call log for every handle a [`MockDriverFactory`] opens.
pub struct MockBackend {
    connects: AtomicUsize,
    closes: AtomicUsize,
    next_handle: AtomicUsize,
    affected_rows: AtomicU64,
    introspection: AtomicBool,
    connect_failures: Mutex<VecDeque<ConduitError>>,
    call_failures: Mutex<VecDeque<ConduitError>>,
    responses: Mutex<VecDeque<RawResponse>>,
    probe_failure: Mutex<Option<ConduitError>>,
    probe_delay: Mutex<Duration>,
    call_delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
    calls: Mutex<Vec<MockCall>>,
    transports: Mutex<Vec<Arc<Mutex<TransportState>>>>,
    last_params: Mutex<Option<ConnectParams>>,
    after_call: Mutex<Option<CallHook>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            next_handle: AtomicUsize::new(0),
            affected_rows: AtomicU64::new(0),
            introspection: AtomicBool::new(true),
            connect_failures: Mutex::new(VecDeque::new()),
            call_failures: Mutex::new(VecDeque::new()),
            responses: Mutex::new(VecDeque::new()),
            probe_failure: Mutex::new(None),
            probe_delay: Mutex::new(Duration::ZERO),
            call_delay: Mutex::new(Duration::ZERO),
            connect_delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            transports: Mutex::new(Vec::new()),
            last_params: Mutex::new(None),
            after_call: Mutex::new(None),
        }
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of handles closed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of handles whose transport is still open.
    pub fn open_handle_count(&self) -> usize {
        lock(&self.transports)
            .iter()
            .filter(|t| lock(t).is_open())
            .count()
    }

    /// Makes the next connect attempt fail.
    pub fn fail_next_connect(&self, error: ConduitError) {
        lock(&self.connect_failures).push_back(error);
    }

    /// Makes the next query/execute call fail. Probes are unaffected.
    pub fn fail_next_call(&self, error: ConduitError) {
        lock(&self.call_failures).push_back(error);
    }

    /// Queues a response for the next query/execute call.
    pub fn push_response(&self, response: RawResponse) {
        lock(&self.responses).push_back(response);
    }

    /// Affected-row count reported by the default execute response.
    pub fn set_affected_rows(&self, rows: u64) {
        self.affected_rows.store(rows, Ordering::SeqCst);
    }

    /// Whether handles report their transport state (tier-1 validation).
    /// Without it a handle only knows it is open while a call is in flight.
    pub fn set_transport_introspection(&self, enabled: bool) {
        self.introspection.store(enabled, Ordering::SeqCst);
    }

    /// Makes every validation probe fail with the given error.
    pub fn fail_probes(&self, error: Option<ConduitError>) {
        *lock(&self.probe_failure) = error;
    }

    /// Delays every validation probe.
    pub fn set_probe_delay(&self, delay: Duration) {
        *lock(&self.probe_delay) = delay;
    }

    /// Delays every connect attempt.
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.connect_delay) = delay;
    }

    /// Delays every query/execute call, keeping it in flight.
    pub fn set_call_delay(&self, delay: Duration) {
        *lock(&self.call_delay) = delay;
    }

    /// Marks every open transport closed, as a dropped network would.
    pub fn sever_connections(&self) {
        for transport in lock(&self.transports).iter() {
            *lock(transport) = TransportState::Closed;
        }
    }

    /// Runs `hook` with the SQL text after each query/execute call completes.
    pub fn on_call(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *lock(&self.after_call) = Some(Box::new(hook));
    }

    /// All calls made so far, probes included.
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Query and execute calls, without probes.
    pub fn statement_calls(&self) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.kind != CallKind::Probe)
            .collect()
    }

    /// Number of validation probes issued.
    pub fn probe_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.kind == CallKind::Probe)
            .count()
    }

    /// Parameters of the most recent successful connect.
    pub fn last_connect_params(&self) -> Option<ConnectParams> {
        lock(&self.last_params).clone()
    }

    fn record(&self, kind: CallKind, sql: &str, handle: usize) {
        lock(&self.calls).push(MockCall {
            kind,
            sql: sql.to_string(),
            handle,
        });
    }

    fn run_after_call(&self, sql: &str) {
        if let Some(hook) = lock(&self.after_call).as_ref() {
            hook(sql);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Factory handing out [`MockDriver`] handles bound to one backend.
#[derive(Clone, Default)]
pub struct MockDriverFactory {
    backend: Arc<MockBackend>,
}

impl MockDriverFactory {
    /// Creates a factory with a fresh backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory sharing the given backend.
    pub fn with_backend(backend: Arc<MockBackend>) -> Self {
        Self { backend }
    }

    /// The shared backend, for scripting and assertions.
    pub fn backend(&self) -> Arc<MockBackend> {
        Arc::clone(&self.backend)
    }
}

#[async_trait]
impl DriverFactory for MockDriverFactory {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn DatabaseDriver>> {
        let delay = *lock(&self.backend.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = lock(&self.backend.connect_failures).pop_front() {
            return Err(error);
        }

        let transport = Arc::new(Mutex::new(TransportState::Open));
        lock(&self.backend.transports).push(Arc::clone(&transport));
        *lock(&self.backend.last_params) = Some(params.clone());
        self.backend.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MockDriver {
            id: self.backend.next_handle.fetch_add(1, Ordering::SeqCst),
            transport,
            in_flight: AtomicUsize::new(0),
            backend: Arc::clone(&self.backend),
        }))
    }
}

/// A mock driver handle.
pub struct MockDriver {
    id: usize,
    transport: Arc<Mutex<TransportState>>,
    in_flight: AtomicUsize,
    backend: Arc<MockBackend>,
}

impl MockDriver {
    /// Sequence number of this handle within its backend.
    pub fn id(&self) -> usize {
        self.id
    }

    fn ensure_open(&self) -> Result<()> {
        if lock(&self.transport).is_open() {
            Ok(())
        } else {
            Err(ConduitError::connection("connection closed"))
        }
    }

    /// Holds the call in flight for the configured delay.
    async fn occupy(&self) {
        let delay = *lock(&self.backend.call_delay);
        if delay.is_zero() {
            return;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn next_scripted(&self) -> Option<Result<RawResponse>> {
        if let Some(error) = lock(&self.backend.call_failures).pop_front() {
            return Some(Err(error));
        }
        lock(&self.backend.responses).pop_front().map(Ok)
    }
}

#[async_trait]
impl DatabaseDriver for MockDriver {
    async fn query(&self, sql: &str) -> Result<RawResponse> {
        self.backend.record(CallKind::Query, sql, self.id);
        self.ensure_open()?;
        self.occupy().await;
        let response = self.next_scripted().unwrap_or_else(|| {
            Ok(RawResponse::Typed(Box::new(MockResultSet::new(
                vec![RawColumn::new("result", Some("VARCHAR"))],
                vec![vec![Value::String(format!("Mock result for: {sql}"))]],
            ))))
        });
        self.backend.run_after_call(sql);
        response
    }

    async fn execute(&self, sql: &str) -> Result<RawResponse> {
        self.backend.record(CallKind::Execute, sql, self.id);
        self.ensure_open()?;
        self.occupy().await;
        let response = self.next_scripted().unwrap_or_else(|| {
            let affected = self.backend.affected_rows.load(Ordering::SeqCst);
            Ok(RawResponse::Envelope(json!({
                "status": "ok",
                "responseData": {
                    "numResults": 1,
                    "results": [{ "resultType": "rowCount", "rowCount": affected }]
                }
            })))
        });
        self.backend.run_after_call(sql);
        response
    }

    async fn probe(&self, sql: &str) -> Result<RawResponse> {
        self.backend.record(CallKind::Probe, sql, self.id);
        let delay = *lock(&self.backend.probe_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.ensure_open()?;
        if let Some(error) = lock(&self.backend.probe_failure).clone() {
            return Err(error);
        }
        Ok(RawResponse::Typed(Box::new(MockResultSet::new(
            vec![RawColumn::new("1", Some("DECIMAL"))],
            vec![vec![Value::Int(1)]],
        ))))
    }

    fn transport_state(&self) -> Option<TransportState> {
        if self.backend.introspection.load(Ordering::SeqCst) {
            Some(*lock(&self.transport))
        } else if self.in_flight.load(Ordering::SeqCst) > 0 {
            Some(TransportState::Open)
        } else {
            None
        }
    }

    async fn close(&self) -> Result<()> {
        *lock(&self.transport) = TransportState::Closed;
        self.backend.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A typed result set held in memory.
#[derive(Debug, Clone, Default)]
pub struct MockResultSet {
    columns: Vec<RawColumn>,
    rows: Vec<Vec<Value>>,
}

impl MockResultSet {
    pub fn new(columns: Vec<RawColumn>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }
}

impl TabularResponse for MockResultSet {
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
