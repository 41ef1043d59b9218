//! Connection registry integration tests.
//!
//! Exercise the registry end to end over the mock driver and memory stores.

use super::{spec, Harness};
use db_conduit::connection::{ConnectionRegistry, RegistryEvent};
use db_conduit::db::{MockDriverFactory, TransportState};
use db_conduit::error::ConduitError;
use db_conduit::persistence::{connection_password_key, SecretStore};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn test_add_then_list_round_trips_without_secret() {
    let h = Harness::new().await;

    let added = h.registry.add_connection(spec("prod")).await.unwrap();
    let listed = h.registry.connections().await;

    assert_eq!(listed, vec![added.clone()]);
    assert_eq!(listed[0].name, "prod");
    assert_eq!(listed[0].host, "prod.db.internal");
    assert_eq!(listed[0].port, 8563);
    assert_eq!(listed[0].user, "analyst");
    assert_eq!(listed[0].default_schema.as_deref(), Some("RETAIL"));

    assert_eq!(
        h.secrets.retrieve(&connection_password_key(&added.id)).unwrap(),
        Some("prod-secret".to_string())
    );
    assert!(!h.metadata.dump().contains("prod-secret"));
}

#[tokio::test]
async fn test_failed_connectivity_test_persists_nothing() {
    let h = Harness::new().await;
    h.backend
        .fail_next_connect(ConduitError::connection("connection refused"));

    let err = h.registry.add_connection(spec("prod")).await.unwrap_err();

    assert!(matches!(err, ConduitError::ConnectionTest(_)));
    assert!(h.registry.connections().await.is_empty());
    assert!(h.secrets.is_empty());
}

#[tokio::test]
async fn test_add_does_not_change_active_connection() {
    let h = Harness::new().await;
    let first = h.add_active("first").await;

    h.registry.add_connection(spec("second")).await.unwrap();

    assert_eq!(h.registry.active_connection_id().await, Some(first));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_driver_opens_one_handle() {
    let h = Harness::new().await;
    let id = h.add_active("prod").await;
    let connects_after_add = h.backend.connect_count();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = h.registry.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            registry.get_driver(Some(&id)).await.map(|_| ())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.backend.connect_count(), connects_after_add + 1);
    assert_eq!(h.backend.open_handle_count(), 1);
    assert!(h.registry.has_live_handle(&id).await);
}

#[tokio::test]
async fn test_severed_transport_reconnects_without_probe() {
    let h = Harness::new().await;
    h.add_active("prod").await;

    h.registry.get_driver(None).await.unwrap();
    h.backend.sever_connections();
    let handle = h.registry.get_driver(None).await.unwrap();

    assert_eq!(handle.transport_state(), Some(TransportState::Open));
    assert_eq!(h.backend.probe_count(), 0);
    assert_eq!(h.backend.open_handle_count(), 1);
}

#[tokio::test]
async fn test_failed_probe_replaces_handle() {
    let h = Harness::new().await;
    h.add_active("prod").await;
    h.backend.set_transport_introspection(false);

    h.registry.get_driver(None).await.unwrap();
    let connects = h.backend.connect_count();

    h.backend
        .fail_probes(Some(ConduitError::query("server closed the session")));
    h.registry.get_driver(None).await.unwrap();

    assert_eq!(h.backend.probe_count(), 1);
    assert_eq!(h.backend.connect_count(), connects + 1);
}

#[tokio::test]
async fn test_remove_active_moves_pointer_and_cleans_up() {
    let h = Harness::new().await;
    let first = h.registry.add_connection(spec("first")).await.unwrap();
    let second = h.registry.add_connection(spec("second")).await.unwrap();
    let third = h.registry.add_connection(spec("third")).await.unwrap();
    h.registry.set_active_connection(&second.id).await.unwrap();
    h.registry.get_driver(None).await.unwrap();

    h.registry.remove_connection(&second.id).await.unwrap();

    assert_eq!(h.registry.active_connection_id().await, Some(first.id.clone()));
    let names: Vec<String> = h
        .registry
        .connections()
        .await
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["first", "third"]);
    assert_eq!(
        h.secrets.retrieve(&connection_password_key(&second.id)).unwrap(),
        None
    );
    assert!(!h.registry.has_live_handle(&second.id).await);
    assert_eq!(h.backend.open_handle_count(), 0);
    assert!(h.registry.find_connection(&third.id).await.is_some());
}

#[tokio::test]
async fn test_remove_last_connection_clears_active() {
    let h = Harness::new().await;
    let id = h.add_active("only").await;

    h.registry.remove_connection(&id).await.unwrap();

    assert_eq!(h.registry.active_connection().await, None);
    assert!(matches!(
        h.registry.get_driver(None).await,
        Err(ConduitError::Config(_))
    ));
}

#[tokio::test]
async fn test_update_keeps_stored_password_and_evicts_handle() {
    let h = Harness::new().await;
    let id = h.add_active("prod").await;
    h.registry.get_driver(None).await.unwrap();
    h.registry.set_session_schema(&id, "STAGING").await.unwrap();

    let mut changed = spec("prod");
    changed.host = "replica.db.internal".to_string();
    changed.password = None;
    h.registry.update_connection(&id, changed).await.unwrap();

    assert!(!h.registry.has_live_handle(&id).await);
    assert_eq!(h.registry.session_schema(&id).await.unwrap(), None);

    h.registry.get_driver(None).await.unwrap();
    let params = h.backend.last_connect_params().unwrap();
    assert_eq!(params.host, "replica.db.internal");
    assert_eq!(params.password.as_deref(), Some("prod-secret"));
    assert_eq!(params.schema.as_deref(), Some("RETAIL"));
}

#[tokio::test]
async fn test_rename_keeps_live_handle() {
    let h = Harness::new().await;
    let id = h.add_active("prod").await;
    h.registry.get_driver(None).await.unwrap();
    let connects = h.backend.connect_count();

    let renamed = h.registry.rename_connection(&id, "production").await.unwrap();

    assert_eq!(renamed.name, "production");
    assert!(h.registry.has_live_handle(&id).await);
    assert_eq!(h.backend.connect_count(), connects);
    assert_eq!(
        h.registry.find_connection("production").await.map(|r| r.id),
        Some(id)
    );
}

#[tokio::test]
async fn test_session_schema_reopened_on_new_handle() {
    let h = Harness::new().await;
    let id = h.add_active("prod").await;

    h.registry.set_session_schema(&id, "STAGING").await.unwrap();
    h.registry.get_driver(None).await.unwrap();

    let params = h.backend.last_connect_params().unwrap();
    assert_eq!(params.schema.as_deref(), Some("STAGING"));
}

#[tokio::test]
async fn test_registry_reopens_from_stores() {
    let h = Harness::new().await;
    let first = h.registry.add_connection(spec("first")).await.unwrap();
    let second = h.add_active("second").await;

    let reopened = ConnectionRegistry::open(
        Arc::new(MockDriverFactory::with_backend(h.backend.clone())),
        h.metadata.clone(),
        h.secrets.clone(),
        &Default::default(),
    )
    .await
    .unwrap();

    let ids: Vec<String> = reopened.connections().await.into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![first.id, second.clone()]);
    assert_eq!(reopened.active_connection_id().await, Some(second));
}

#[tokio::test]
async fn test_events_follow_mutations() {
    let h = Harness::new().await;
    let mut events = h.registry.subscribe();

    let id = h.add_active("prod").await;
    h.registry.remove_connection(&id).await.unwrap();

    assert_eq!(events.recv().await.unwrap(), RegistryEvent::ConnectionsChanged);
    assert_eq!(
        events.recv().await.unwrap(),
        RegistryEvent::ActiveConnectionChanged(Some(id))
    );
    assert_eq!(events.recv().await.unwrap(), RegistryEvent::ConnectionsChanged);
    assert_eq!(
        events.recv().await.unwrap(),
        RegistryEvent::ActiveConnectionChanged(None)
    );
}

#[tokio::test]
async fn test_retry_resets_once_on_transient_failure() {
    let h = Harness::new().await;
    let id = h.add_active("prod").await;
    h.registry.get_driver(None).await.unwrap();
    let closes = h.backend.close_count();

    let counter = AtomicUsize::new(0);
    let calls = &counter;
    let value = h
        .registry
        .execute_with_retry(Some(&id), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ConduitError::connection("read ECONNRESET"))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(h.backend.close_count(), closes + 1);
}

#[tokio::test]
async fn test_retry_skips_non_transient_failure() {
    let h = Harness::new().await;
    let id = h.add_active("prod").await;
    h.registry.get_driver(None).await.unwrap();

    let counter = AtomicUsize::new(0);
    let calls = &counter;
    let err = h
        .registry
        .execute_with_retry(Some(&id), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ConduitError::query("syntax error at or near \"SELEC\""))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ConduitError::Query(_)));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(h.registry.has_live_handle(&id).await);
}
