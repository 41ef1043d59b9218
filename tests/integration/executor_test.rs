//! Query executor integration tests.
//!
//! Drive the executor through a registry backed by the mock driver.

use super::Harness;
use db_conduit::config::ExecutionConfig;
use db_conduit::db::{CallKind, MockResultSet, RawColumn, RawResponse, Value};
use db_conduit::error::ConduitError;
use db_conduit::query::{HistoryFilter, QueryStatus, SubmittedBy};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn people() -> RawResponse {
    RawResponse::Typed(Box::new(MockResultSet::new(
        vec![
            RawColumn::new("ID", Some("DECIMAL")),
            RawColumn::new("NAME", Some("VARCHAR")),
        ],
        vec![
            vec![Value::Int(1), Value::String("Ada".to_string())],
            vec![Value::Int(2), Value::String("Grace".to_string())],
            vec![Value::Int(3), Value::String("Edsger".to_string())],
        ],
    )))
}

#[tokio::test]
async fn test_projection_gets_row_ceiling() {
    let h = Harness::new().await;
    h.add_active("prod").await;

    h.executor.execute("SELECT * FROM T", None).await.unwrap();

    let calls = h.backend.statement_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, CallKind::Query);
    assert!(calls[0].sql.ends_with("LIMIT 10000"));
}

#[tokio::test]
async fn test_explicit_limit_is_untouched() {
    let h = Harness::new().await;
    h.add_active("prod").await;

    h.executor
        .execute("SELECT * FROM T LIMIT 5;", None)
        .await
        .unwrap();

    assert_eq!(h.backend.statement_calls()[0].sql, "SELECT * FROM T LIMIT 5");
}

#[tokio::test]
async fn test_configured_row_ceiling() {
    let h = Harness::with_config(ExecutionConfig {
        max_result_rows: 250,
        ..ExecutionConfig::default()
    })
    .await;
    h.add_active("prod").await;

    h.executor.execute("SELECT a FROM b", None).await.unwrap();

    assert_eq!(h.backend.statement_calls()[0].sql, "SELECT a FROM b LIMIT 250");
}

#[tokio::test]
async fn test_side_effecting_statements_use_execute_path() {
    let h = Harness::new().await;
    h.add_active("prod").await;
    h.backend.set_affected_rows(4);

    let insert = h
        .executor
        .execute("-- note\nINSERT INTO t VALUES (1)", None)
        .await
        .unwrap();
    h.executor
        .execute("SELECT a INTO new_t FROM b", None)
        .await
        .unwrap();

    assert!(!insert.is_tabular());
    assert_eq!(insert.row_count, 4);
    let calls = h.backend.statement_calls();
    assert!(calls.iter().all(|c| c.kind == CallKind::Execute));
    assert!(!calls[1].sql.contains("LIMIT"));
}

#[tokio::test]
async fn test_typed_rows_keyed_by_column() {
    let h = Harness::new().await;
    h.add_active("prod").await;
    h.backend.push_response(people());

    let result = h.executor.execute("SELECT * FROM PEOPLE", None).await.unwrap();

    assert_eq!(result.columns, vec!["ID", "NAME"]);
    assert_eq!(result.row_count, 3);
    assert_eq!(result.rows[1]["NAME"], Value::String("Grace".to_string()));
    assert_eq!(result.column_metadata[0].data_type, "DECIMAL");
}

#[tokio::test]
async fn test_no_active_connection_makes_no_driver_call() {
    let h = Harness::new().await;

    let err = h.executor.execute("SELECT 1 + 1", None).await.unwrap_err();

    assert!(matches!(err, ConduitError::Config(_)));
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn test_cancel_before_dispatch() {
    let h = Harness::new().await;
    h.add_active("prod").await;
    let token = CancellationToken::new();
    token.cancel();

    let err = h
        .executor
        .execute("SELECT * FROM T", Some(token))
        .await
        .unwrap_err();

    assert_eq!(err, ConduitError::Cancelled);
    assert!(h.backend.statement_calls().is_empty());
}

#[tokio::test]
async fn test_cancel_during_call_withholds_data() {
    let h = Harness::new().await;
    h.add_active("prod").await;
    h.backend.push_response(people());

    let token = CancellationToken::new();
    let hook_token = token.clone();
    h.backend.on_call(move |_| hook_token.cancel());

    let err = h
        .executor
        .execute("SELECT * FROM PEOPLE", Some(token))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(h.backend.statement_calls().len(), 1);

    let entries = h.history.list(&HistoryFilter::default()).await.unwrap();
    assert_eq!(entries[0].status, QueryStatus::Cancelled);
}

#[tokio::test]
async fn test_error_envelope_message_is_verbatim() {
    let h = Harness::new().await;
    h.add_active("prod").await;
    h.backend.push_response(RawResponse::Envelope(json!({
        "status": "error",
        "exception": {"text": "object MISSING not found [line 1, column 15]", "sqlCode": "42000"}
    })));

    let err = h
        .executor
        .execute("SELECT * FROM MISSING", None)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ConduitError::query("object MISSING not found [line 1, column 15]")
    );
}

#[tokio::test]
async fn test_non_tabular_first_entry_gives_empty_result() {
    let h = Harness::new().await;
    h.add_active("prod").await;
    h.backend.push_response(RawResponse::Envelope(json!({
        "status": "ok",
        "responseData": {"results": [
            {"resultType": "rowCount", "rowCount": 0},
            {"resultType": "resultSet", "resultSet": {"columns": [{"name": "A"}], "data": [[1]]}}
        ]}
    })));

    let result = h.executor.execute("SELECT A FROM B", None).await.unwrap();

    assert!(result.columns.is_empty());
    assert!(result.rows.is_empty());
}

#[tokio::test]
async fn test_transient_failure_retried_on_fresh_handle() {
    let h = Harness::new().await;
    h.add_active("prod").await;
    h.backend
        .fail_next_call(ConduitError::connection("write EPIPE: broken pipe"));

    let result = h.executor.execute("SELECT 2 + 2", None).await.unwrap();

    assert_eq!(result.row_count, 1);
    let calls = h.backend.statement_calls();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].handle, calls[1].handle);
}

#[tokio::test]
async fn test_second_transient_failure_is_returned() {
    let h = Harness::new().await;
    h.add_active("prod").await;
    h.backend
        .fail_next_call(ConduitError::connection("connection reset by peer"));
    h.backend
        .fail_next_call(ConduitError::connection("connection reset by peer"));

    let err = h.executor.execute("SELECT 2 + 2", None).await.unwrap_err();

    assert_eq!(err, ConduitError::connection("connection reset by peer"));
    assert_eq!(h.backend.statement_calls().len(), 2);
}

#[tokio::test]
async fn test_schema_switch_survives_reconnect() {
    let h = Harness::new().await;
    let id = h.add_active("prod").await;

    h.executor.execute("OPEN SCHEMA STAGING", None).await.unwrap();
    assert_eq!(
        h.registry.session_schema(&id).await.unwrap().as_deref(),
        Some("STAGING")
    );

    h.backend.sever_connections();
    h.executor.execute("SELECT 3 + 3", None).await.unwrap();

    let params = h.backend.last_connect_params().unwrap();
    assert_eq!(params.schema.as_deref(), Some("STAGING"));
}

#[tokio::test]
async fn test_fetch_caps_rows_without_rewriting() {
    let h = Harness::new().await;
    h.add_active("prod").await;
    h.backend.push_response(people());

    let result = h
        .executor
        .execute_and_fetch("SELECT * FROM PEOPLE", Some(2))
        .await
        .unwrap();

    assert_eq!(result.rows.len(), 2);
    assert!(result.was_truncated);
    assert_eq!(h.backend.statement_calls()[0].sql, "SELECT * FROM PEOPLE");
}

#[tokio::test]
async fn test_history_records_outcomes() {
    let h = Harness::new().await;
    let id = h.add_active("prod").await;
    h.backend.fail_next_call(ConduitError::query("division by zero"));

    h.executor.execute("SELECT 1 / 0", None).await.unwrap_err();
    h.executor.execute("SELECT 4 + 4", None).await.unwrap();

    let entries = h
        .history
        .list(&HistoryFilter {
            connection_id: Some(id),
            ..HistoryFilter::default()
        })
        .await
        .unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].sql, "SELECT 4 + 4");
    assert_eq!(entries[0].status, QueryStatus::Success);
    assert_eq!(entries[1].status, QueryStatus::Error);
    assert_eq!(entries[1].error_message.as_deref(), Some("division by zero"));
    assert!(entries.iter().all(|e| e.submitted_by == SubmittedBy::User));
}

#[tokio::test]
async fn test_validation_probes_recorded_when_enabled() {
    let h = Harness::with_config(ExecutionConfig {
        record_validation_probes: true,
        ..ExecutionConfig::default()
    })
    .await;
    h.add_active("prod").await;
    h.backend.set_transport_introspection(false);

    h.executor.execute("SELECT 5 + 5", None).await.unwrap();
    h.executor.execute("SELECT 6 + 6", None).await.unwrap();

    let entries = h.history.list(&HistoryFilter::default()).await.unwrap();
    let probes: Vec<_> = entries
        .iter()
        .filter(|e| e.submitted_by == SubmittedBy::Probe)
        .collect();
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].sql, "SELECT 1");
}
