//! Integration tests for db-conduit.

pub mod classify_test;
pub mod executor_test;
pub mod persistence_test;
pub mod postgres_test;
pub mod registry_test;

use std::sync::Arc;

use db_conduit::config::{ConnectionSpec, ExecutionConfig};
use db_conduit::connection::ConnectionRegistry;
use db_conduit::db::{MockBackend, MockDriverFactory};
use db_conduit::persistence::{MemoryMetadataStore, MemorySecretStore};
use db_conduit::query::{QueryExecutor, QueryHistory};

/// A registry and executor wired to a mock backend and in-memory stores.
pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub metadata: Arc<MemoryMetadataStore>,
    pub secrets: Arc<MemorySecretStore>,
    pub history: Arc<QueryHistory>,
    pub registry: Arc<ConnectionRegistry>,
    pub executor: QueryExecutor,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(ExecutionConfig::default()).await
    }

    pub async fn with_config(config: ExecutionConfig) -> Self {
        let backend = Arc::new(MockBackend::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let secrets = Arc::new(MemorySecretStore::new());
        let history = Arc::new(QueryHistory::new(
            metadata.clone(),
            config.max_query_history_size,
        ));

        let registry = Arc::new(
            ConnectionRegistry::open(
                Arc::new(MockDriverFactory::with_backend(backend.clone())),
                metadata.clone(),
                secrets.clone(),
                &config,
            )
            .await
            .unwrap()
            .with_history(history.clone()),
        );
        let executor = QueryExecutor::new(registry.clone(), &config).with_history(history.clone());

        Self {
            backend,
            metadata,
            secrets,
            history,
            registry,
            executor,
        }
    }

    /// Adds a connection and makes it active. Returns its id.
    pub async fn add_active(&self, name: &str) -> String {
        let record = self.registry.add_connection(spec(name)).await.unwrap();
        self.registry.set_active_connection(&record.id).await.unwrap();
        record.id
    }
}

/// A connection spec with a password and a default schema.
pub fn spec(name: &str) -> ConnectionSpec {
    ConnectionSpec {
        name: name.to_string(),
        host: format!("{name}.db.internal"),
        port: 8563,
        user: "analyst".to_string(),
        password: Some(format!("{name}-secret")),
        default_schema: Some("RETAIL".to_string()),
    }
}
