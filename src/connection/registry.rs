//! Connection registry.
//!
//! Owns the named connection records, the active-connection pointer, and
//! the cache of live driver handles. Every query reaches the database
//! through [`ConnectionRegistry::get_driver`], which validates a cached
//! handle before reusing it, and [`ConnectionRegistry::execute_with_retry`],
//! the one place a failed operation is retried.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::retry::{self, RETRY_DELAY};
use crate::config::{ConnectionSpec, ExecutionConfig};
use crate::db::{ConnectParams, DatabaseDriver, DriverFactory};
use crate::error::{ConduitError, Result};
use crate::persistence::{connection_password_key, get_json, set_json, MetadataStore, SecretStore};
use crate::query::history::{HistoryEntry, QueryHistory, QueryStatus, SubmittedBy};

const CONNECTIONS_KEY: &str = "connections";
const ACTIVE_CONNECTION_KEY: &str = "active_connection";

/// Upper bound on the connectivity test run by add and update.
const CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_CAPACITY: usize = 64;

fn record_key(id: &str) -> String {
    format!("connection:{id}")
}

fn session_schema_key(id: &str) -> String {
    format!("session_schema:{id}")
}

/// A saved connection. Carries no password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub default_schema: Option<String>,
}

impl ConnectionRecord {
    fn from_spec(id: String, spec: &ConnectionSpec) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            host: spec.host.clone(),
            port: spec.port,
            user: spec.user.clone(),
            default_schema: spec.default_schema.clone(),
        }
    }

    /// Returns a display-safe `user@host:port` string.
    pub fn display_string(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A record was added, updated, renamed, or removed.
    ConnectionsChanged,
    /// The active pointer moved. Carries the new active id.
    ActiveConnectionChanged(Option<String>),
}

/// Cache slot for one connection id.
enum HandleSlot {
    Absent,
    Live(Arc<dyn DatabaseDriver>),
}

#[derive(Default)]
struct RegistryState {
    /// Records in insertion order.
    records: IndexMap<String, ConnectionRecord>,
    active: Option<String>,
}

/// Named connections, the active pointer, and at most one live handle per id.
pub struct ConnectionRegistry {
    factory: Arc<dyn DriverFactory>,
    metadata: Arc<dyn MetadataStore>,
    secrets: Arc<dyn SecretStore>,
    config: ExecutionConfig,
    state: RwLock<RegistryState>,
    /// Per-id slot locks. The outer lock is only held to look a slot up.
    slots: StdMutex<HashMap<String, Arc<Mutex<HandleSlot>>>>,
    events: broadcast::Sender<RegistryEvent>,
    history: Option<Arc<QueryHistory>>,
}

impl ConnectionRegistry {
    /// Creates a registry and loads saved records and the active pointer.
    pub async fn open(
        factory: Arc<dyn DriverFactory>,
        metadata: Arc<dyn MetadataStore>,
        secrets: Arc<dyn SecretStore>,
        config: &ExecutionConfig,
    ) -> Result<Self> {
        let mut state = RegistryState::default();

        let ids: Vec<String> = get_json(metadata.as_ref(), CONNECTIONS_KEY)
            .await?
            .unwrap_or_default();
        for id in ids {
            match get_json::<ConnectionRecord>(metadata.as_ref(), &record_key(&id)).await? {
                Some(record) => {
                    state.records.insert(id, record);
                }
                None => warn!("Connection '{id}' is listed but has no record; skipping"),
            }
        }

        let active: Option<String> = get_json(metadata.as_ref(), ACTIVE_CONNECTION_KEY).await?;
        state.active = active.filter(|id| {
            let known = state.records.contains_key(id);
            if !known {
                warn!("Active connection '{id}' no longer exists; clearing");
            }
            known
        });

        debug!("Loaded {} saved connections", state.records.len());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            factory,
            metadata,
            secrets,
            config: config.clone(),
            state: RwLock::new(state),
            slots: StdMutex::new(HashMap::new()),
            events,
            history: None,
        })
    }

    /// Attaches a query history, used to record validation probes when
    /// configured to.
    pub fn with_history(mut self, history: Arc<QueryHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Subscribes to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Adds a connection after a successful connectivity test.
    ///
    /// Nothing is persisted when the test fails. The active pointer is left
    /// unchanged.
    pub async fn add_connection(&self, spec: ConnectionSpec) -> Result<ConnectionRecord> {
        validate_spec(&spec)?;

        self.test_connection(&ConnectParams {
            host: spec.host.clone(),
            port: spec.port,
            user: spec.user.clone(),
            password: spec.password.clone(),
            schema: spec.default_schema.clone(),
        })
        .await?;

        let id = Uuid::new_v4().to_string();
        if let Some(password) = &spec.password {
            self.secrets.store(&connection_password_key(&id), password)?;
        }

        let record = ConnectionRecord::from_spec(id.clone(), &spec);
        {
            let mut state = self.state.write().await;
            set_json(self.metadata.as_ref(), &record_key(&id), &record).await?;
            state.records.insert(id.clone(), record.clone());
            self.persist_ids(&state).await?;
        }

        info!("Added connection '{}' ({})", record.name, record.display_string());
        self.emit(RegistryEvent::ConnectionsChanged);
        Ok(record)
    }

    /// Replaces a connection's settings after a successful connectivity test.
    ///
    /// A `None` password keeps the stored one. Any live handle is closed and
    /// evicted, and the recorded session schema is cleared.
    pub async fn update_connection(&self, id: &str, spec: ConnectionSpec) -> Result<ConnectionRecord> {
        self.require_record(id).await?;
        validate_spec(&spec)?;

        let key = connection_password_key(id);
        let password = match &spec.password {
            Some(password) => Some(password.clone()),
            None => self.secrets.retrieve(&key)?,
        };

        self.test_connection(&ConnectParams {
            host: spec.host.clone(),
            port: spec.port,
            user: spec.user.clone(),
            password,
            schema: spec.default_schema.clone(),
        })
        .await?;

        self.reset_driver(Some(id)).await?;

        if let Some(password) = &spec.password {
            self.secrets.store(&key, password)?;
        }

        let record = ConnectionRecord::from_spec(id.to_string(), &spec);
        {
            let mut state = self.state.write().await;
            if !state.records.contains_key(id) {
                return Err(ConduitError::unknown_connection(id));
            }
            set_json(self.metadata.as_ref(), &record_key(id), &record).await?;
            self.metadata.delete(&session_schema_key(id)).await?;
            state.records.insert(id.to_string(), record.clone());
        }

        info!("Updated connection '{}' ({})", record.name, record.display_string());
        self.emit(RegistryEvent::ConnectionsChanged);
        Ok(record)
    }

    /// Changes only the display name. The live handle is untouched.
    pub async fn rename_connection(&self, id: &str, name: &str) -> Result<ConnectionRecord> {
        if name.trim().is_empty() {
            return Err(ConduitError::config("connection name must not be empty"));
        }

        let record = {
            let mut state = self.state.write().await;
            let record = state
                .records
                .get_mut(id)
                .ok_or_else(|| ConduitError::unknown_connection(id))?;
            let mut renamed = record.clone();
            renamed.name = name.to_string();
            set_json(self.metadata.as_ref(), &record_key(id), &renamed).await?;
            *record = renamed.clone();
            renamed
        };

        info!("Renamed connection {id} to '{name}'");
        self.emit(RegistryEvent::ConnectionsChanged);
        Ok(record)
    }

    /// Removes a connection, its secret, and its session state, and evicts
    /// its handle.
    ///
    /// When the removed connection was active, the pointer moves to the
    /// first remaining connection in insertion order, or is cleared.
    pub async fn remove_connection(&self, id: &str) -> Result<()> {
        let moved_to = {
            let mut state = self.state.write().await;
            let removed = state
                .records
                .shift_remove(id)
                .ok_or_else(|| ConduitError::unknown_connection(id))?;

            self.metadata.delete(&record_key(id)).await?;
            self.metadata.delete(&session_schema_key(id)).await?;
            self.persist_ids(&state).await?;

            let moved_to = if state.active.as_deref() == Some(id) {
                let next = state.records.keys().next().cloned();
                state.active = next.clone();
                self.persist_active(&state).await?;
                Some(next)
            } else {
                None
            };

            info!("Removed connection '{}'", removed.name);
            moved_to
        };

        self.reset_driver(Some(id)).await?;
        lock_slots(&self.slots).remove(id);

        self.emit(RegistryEvent::ConnectionsChanged);
        if let Some(next) = moved_to {
            self.emit(RegistryEvent::ActiveConnectionChanged(next));
        }

        // The record is gone; a leftover secret is unreachable.
        if let Err(e) = self.secrets.delete(&connection_password_key(id)) {
            warn!("Failed to delete stored password for {id}: {e}");
        }
        Ok(())
    }

    /// Points the registry at a connection.
    pub async fn set_active_connection(&self, id: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if !state.records.contains_key(id) {
                return Err(ConduitError::unknown_connection(id));
            }
            state.active = Some(id.to_string());
            self.persist_active(&state).await?;
        }

        info!("Active connection set to {id}");
        self.emit(RegistryEvent::ActiveConnectionChanged(Some(id.to_string())));
        Ok(())
    }

    /// The active connection, if one is set.
    pub async fn active_connection(&self) -> Option<ConnectionRecord> {
        let state = self.state.read().await;
        state
            .active
            .as_ref()
            .and_then(|id| state.records.get(id))
            .cloned()
    }

    /// Id of the active connection, if one is set.
    pub async fn active_connection_id(&self) -> Option<String> {
        self.state.read().await.active.clone()
    }

    /// All connections in insertion order.
    pub async fn connections(&self) -> Vec<ConnectionRecord> {
        self.state.read().await.records.values().cloned().collect()
    }

    /// Looks a connection up by id, then by display name.
    pub async fn find_connection(&self, id_or_name: &str) -> Option<ConnectionRecord> {
        let state = self.state.read().await;
        state.records.get(id_or_name).cloned().or_else(|| {
            state
                .records
                .values()
                .find(|r| r.name == id_or_name)
                .cloned()
        })
    }

    /// Schema the user last switched to on a connection.
    pub async fn session_schema(&self, id: &str) -> Result<Option<String>> {
        get_json(self.metadata.as_ref(), &session_schema_key(id)).await
    }

    /// Records the session schema so new handles reopen it.
    pub async fn set_session_schema(&self, id: &str, schema: &str) -> Result<()> {
        self.require_record(id).await?;
        set_json(self.metadata.as_ref(), &session_schema_key(id), schema).await?;
        debug!("Session schema for {id} set to {schema}");
        Ok(())
    }

    /// Returns a usable handle for `id`, or the active connection.
    ///
    /// A cached handle is validated first; a dead one is closed and replaced.
    pub async fn get_driver(&self, id: Option<&str>) -> Result<Arc<dyn DatabaseDriver>> {
        let id = self.resolve_id(id).await?;
        let slot = self.slot(&id);
        let mut guard = slot.lock().await;

        if let HandleSlot::Live(handle) = &*guard {
            if self.validate(&id, handle.as_ref()).await {
                return Ok(Arc::clone(handle));
            }
            debug!("Cached handle for {id} is stale; reconnecting");
            close_quietly(&id, handle.as_ref()).await;
            *guard = HandleSlot::Absent;
        }

        // Read under the slot lock so a concurrent remove is observed.
        let record = self.require_record(&id).await?;
        let handle = self.open_handle(&record).await?;
        *guard = HandleSlot::Live(Arc::clone(&handle));
        Ok(handle)
    }

    /// Closes and evicts the cached handle for `id`, or the active connection.
    ///
    /// Close failures are logged and swallowed.
    pub async fn reset_driver(&self, id: Option<&str>) -> Result<()> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self
                .active_connection_id()
                .await
                .ok_or_else(ConduitError::no_active_connection)?,
        };

        let Some(slot) = lock_slots(&self.slots).get(&id).cloned() else {
            return Ok(());
        };

        let mut guard = slot.lock().await;
        if let HandleSlot::Live(handle) = std::mem::replace(&mut *guard, HandleSlot::Absent) {
            close_quietly(&id, handle.as_ref()).await;
            debug!("Evicted handle for {id}");
        }
        Ok(())
    }

    /// Closes every cached handle.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = lock_slots(&self.slots).keys().cloned().collect();
        for id in ids {
            // Only fails on a missing active pointer, which cannot happen with an explicit id.
            let _ = self.reset_driver(Some(&id)).await;
        }
    }

    /// Whether a live handle is cached for `id`.
    pub async fn has_live_handle(&self, id: &str) -> bool {
        let Some(slot) = lock_slots(&self.slots).get(id).cloned() else {
            return false;
        };
        let guard = slot.lock().await;
        matches!(*guard, HandleSlot::Live(_))
    }

    /// Runs `op`, retrying exactly once after a transient failure.
    ///
    /// Before the retry the handle for `id` (or the active connection) is
    /// reset and a fixed delay elapses. Non-transient failures, and the
    /// outcome of the retry, are returned unchanged.
    pub async fn execute_with_retry<T, F, Fut>(&self, id: Option<&str>, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let Some(pattern) = retry::transient_pattern(&error) else {
            return Err(error);
        };

        warn!(
            "Transient failure ({}): {}; resetting connection and retrying once",
            pattern.name,
            error.message()
        );
        if let Err(reset_error) = self.reset_driver(id).await {
            debug!("Reset before retry failed: {reset_error}");
        }
        tokio::time::sleep(RETRY_DELAY).await;

        op().await
    }

    async fn resolve_id(&self, id: Option<&str>) -> Result<String> {
        let state = self.state.read().await;
        match id {
            Some(id) if state.records.contains_key(id) => Ok(id.to_string()),
            Some(id) => Err(ConduitError::unknown_connection(id)),
            None => state
                .active
                .clone()
                .ok_or_else(ConduitError::no_active_connection),
        }
    }

    async fn require_record(&self, id: &str) -> Result<ConnectionRecord> {
        self.state
            .read()
            .await
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| ConduitError::unknown_connection(id))
    }

    fn slot(&self, id: &str) -> Arc<Mutex<HandleSlot>> {
        Arc::clone(
            lock_slots(&self.slots)
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(HandleSlot::Absent))),
        )
    }

    /// Opens and closes a throwaway handle.
    #[instrument(skip(self, params), fields(host = %params.host, port = params.port, user = %params.user))]
    async fn test_connection(&self, params: &ConnectParams) -> Result<()> {
        let test = async {
            let handle = self.factory.connect(params).await?;
            if let Err(e) = handle.close().await {
                warn!("Failed to close test connection: {e}");
            }
            Ok::<_, ConduitError>(())
        };

        match timeout(CONNECTION_TEST_TIMEOUT, test).await {
            Ok(Ok(())) => {
                debug!("Connectivity test passed");
                Ok(())
            }
            Ok(Err(e)) => Err(ConduitError::connection_test(e.message())),
            Err(_) => Err(ConduitError::connection_test(format!(
                "timed out after {}s",
                CONNECTION_TEST_TIMEOUT.as_secs()
            ))),
        }
    }

    #[instrument(skip(self, record), fields(connection_id = %record.id, host = %record.host, port = record.port))]
    async fn open_handle(&self, record: &ConnectionRecord) -> Result<Arc<dyn DatabaseDriver>> {
        let password = self.secrets.retrieve(&connection_password_key(&record.id))?;
        let schema = match self.session_schema(&record.id).await? {
            Some(schema) => Some(schema),
            None => record.default_schema.clone(),
        };

        let params = ConnectParams {
            host: record.host.clone(),
            port: record.port,
            user: record.user.clone(),
            password,
            schema,
        };
        let handle = self.factory.connect(&params).await?;
        debug!("Opened handle (schema: {:?})", params.schema);
        Ok(handle)
    }

    /// Two-tier liveness check: local transport state, then a timed round trip.
    async fn validate(&self, id: &str, handle: &dyn DatabaseDriver) -> bool {
        match handle.transport_state() {
            Some(state) if state.is_open() => return true,
            Some(state) => {
                debug!("Handle for {id} reports transport {state}");
                return false;
            }
            None => {}
        }

        let probe_sql = &self.config.validation_probe_sql;
        let started = Instant::now();
        let outcome = match timeout(self.config.validation_timeout(), handle.probe(probe_sql)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.message().to_string()),
            Err(_) => Err(format!(
                "validation probe timed out after {}ms",
                self.config.connection_validation_timeout_ms
            )),
        };

        if let Err(reason) = &outcome {
            debug!("Validation probe for {id} failed: {reason}");
        }
        self.record_probe(id, started.elapsed(), &outcome).await;
        outcome.is_ok()
    }

    async fn record_probe(&self, id: &str, elapsed: Duration, outcome: &std::result::Result<(), String>) {
        if !self.config.record_validation_probes {
            return;
        }
        let Some(history) = &self.history else {
            return;
        };

        let status = if outcome.is_ok() {
            QueryStatus::Success
        } else {
            QueryStatus::Error
        };
        let mut entry = HistoryEntry::new(id, SubmittedBy::Probe, &self.config.validation_probe_sql, status);
        entry.execution_time_ms = Some(elapsed.as_millis() as u64);
        entry.error_message = outcome.as_ref().err().cloned();

        if let Err(e) = history.record(entry).await {
            warn!("Failed to record validation probe: {e}");
        }
    }

    async fn persist_ids(&self, state: &RegistryState) -> Result<()> {
        let ids: Vec<&String> = state.records.keys().collect();
        set_json(self.metadata.as_ref(), CONNECTIONS_KEY, &ids).await
    }

    async fn persist_active(&self, state: &RegistryState) -> Result<()> {
        match &state.active {
            Some(id) => set_json(self.metadata.as_ref(), ACTIVE_CONNECTION_KEY, id).await,
            None => self.metadata.delete(ACTIVE_CONNECTION_KEY).await,
        }
    }
}

fn validate_spec(spec: &ConnectionSpec) -> Result<()> {
    if spec.name.trim().is_empty() {
        return Err(ConduitError::config("connection name must not be empty"));
    }
    if spec.host.trim().is_empty() {
        return Err(ConduitError::config("connection host must not be empty"));
    }
    Ok(())
}

fn lock_slots<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn close_quietly(id: &str, handle: &dyn DatabaseDriver) {
    if let Err(e) = handle.close().await {
        warn!("Failed to close handle for {id}: {e}");
    }
}
