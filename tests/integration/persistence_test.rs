//! Integration tests for the persistence layer.
//!
//! Run the registry and history over a real SQLite state database.

use super::spec;
use db_conduit::config::ExecutionConfig;
use db_conduit::connection::ConnectionRegistry;
use db_conduit::db::MockDriverFactory;
use db_conduit::persistence::{
    connection_password_key, MemorySecretStore, MetadataStore, SecretStore, StateDb,
};
use db_conduit::query::{HistoryEntry, HistoryFilter, QueryHistory, QueryStatus, SubmittedBy};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::tempdir;

async fn open_registry(
    db: Arc<StateDb>,
    secrets: Arc<MemorySecretStore>,
) -> ConnectionRegistry {
    ConnectionRegistry::open(
        Arc::new(MockDriverFactory::new()),
        db,
        secrets,
        &ExecutionConfig::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_connections_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    let secrets = Arc::new(MemorySecretStore::new());

    let (first, second) = {
        let db = Arc::new(StateDb::open(&path).await.unwrap());
        let registry = open_registry(db.clone(), secrets.clone()).await;
        let first = registry.add_connection(spec("first")).await.unwrap();
        let second = registry.add_connection(spec("second")).await.unwrap();
        registry.set_active_connection(&second.id).await.unwrap();
        registry
            .set_session_schema(&second.id, "STAGING")
            .await
            .unwrap();
        db.close().await;
        (first, second)
    };

    let db = Arc::new(StateDb::open(&path).await.unwrap());
    let registry = open_registry(db.clone(), secrets.clone()).await;

    assert_eq!(registry.connections().await, vec![first, second.clone()]);
    assert_eq!(registry.active_connection().await, Some(second.clone()));
    assert_eq!(
        registry.session_schema(&second.id).await.unwrap().as_deref(),
        Some("STAGING")
    );
    db.close().await;
}

#[tokio::test]
async fn test_state_db_never_holds_passwords() {
    let dir = tempdir().unwrap();
    let db = Arc::new(StateDb::open(&dir.path().join("state.db")).await.unwrap());
    let secrets = Arc::new(MemorySecretStore::new());
    let registry = open_registry(db.clone(), secrets.clone()).await;

    let record = registry.add_connection(spec("prod")).await.unwrap();

    let mut stored = String::new();
    for key in db.keys().await.unwrap() {
        let value = db.get(&key).await.unwrap().unwrap();
        stored.push_str(&format!("{key}={value}\n"));
    }
    assert!(stored.contains(&format!("connection:{}", record.id)));
    assert!(!stored.contains("prod-secret"));
    assert_eq!(
        secrets.retrieve(&connection_password_key(&record.id)).unwrap(),
        Some("prod-secret".to_string())
    );
    db.close().await;
}

#[tokio::test]
async fn test_history_is_bounded_and_persistent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");

    {
        let db = Arc::new(StateDb::open(&path).await.unwrap());
        let history = QueryHistory::new(db.clone(), 3);
        for i in 0..5 {
            let entry = HistoryEntry::new(
                "conn-1",
                SubmittedBy::User,
                format!("SELECT {i}"),
                QueryStatus::Success,
            );
            history.record(entry).await.unwrap();
        }
        db.close().await;
    }

    let db = Arc::new(StateDb::open(&path).await.unwrap());
    let history = QueryHistory::new(db.clone(), 3);
    let entries = history.list(&HistoryFilter::default()).await.unwrap();

    let sql: Vec<&str> = entries.iter().map(|e| e.sql.as_str()).collect();
    assert_eq!(sql, vec!["SELECT 4", "SELECT 3", "SELECT 2"]);

    let filtered = history
        .list(&HistoryFilter {
            text_search: Some("select 3".to_string()),
            ..HistoryFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    db.close().await;
}
