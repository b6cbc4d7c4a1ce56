//! Durable storage round trips through the SQLite adapter.

#![cfg(feature = "sqlite")]

use mycelia::call::StoredSlot;
use mycelia::errors::CallError;
use mycelia::identity::call_id;
use mycelia::storage::{CallRow, ResultLookup, SqliteStorage, Storage, StoredOutcome};
use mycelia::types::{CallStatus, NodeRef};
use serde_json::json;
use std::path::PathBuf;

fn temp_url(name: &str) -> (String, PathBuf) {
    let mut path = std::env::temp_dir();
    path.push(name);
    let _ = std::fs::remove_file(&path);
    (format!("sqlite://{}", path.display()), path)
}

fn sample_row(node: &str) -> CallRow {
    let node_ref = NodeRef::new("g", node);
    let id = call_id(&node_ref, &[], &[], &[]);
    CallRow::new(
        id,
        node_ref,
        vec![StoredSlot::Literal { value: json!(5) }],
        vec![("label".to_string(), StoredSlot::Literal { value: json!("A") })],
        vec![],
        CallStatus::Pending,
    )
}

#[tokio::test]
async fn call_rows_round_trip() {
    let (url, path) = temp_url("mycelia_sqlite_roundtrip.db");
    let storage = SqliteStorage::connect(&url).await.unwrap();

    let row = sample_row("echo");
    let id = row.id;
    storage.put_call(row.clone()).await.unwrap();

    let stored = storage.get_call(id).await.unwrap().unwrap();
    assert_eq!(stored.id, row.id);
    assert_eq!(stored.node_ref, row.node_ref);
    assert_eq!(stored.args, row.args);
    assert_eq!(stored.kwargs, row.kwargs);
    assert_eq!(stored.status, CallStatus::Pending);
    assert_eq!(stored.result, None);

    // Insert is idempotent: a second put with a different status is a
    // no-op.
    let mut again = row.clone();
    again.status = CallStatus::Ready;
    storage.put_call(again).await.unwrap();
    let stored = storage.get_call(id).await.unwrap().unwrap();
    assert_eq!(stored.status, CallStatus::Pending);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn results_and_forwards_round_trip() {
    let (url, path) = temp_url("mycelia_sqlite_results.db");
    let storage = SqliteStorage::connect(&url).await.unwrap();

    let a = sample_row("a");
    let b = sample_row("b");
    let (a_id, b_id) = (a.id, b.id);
    storage.put_call(a).await.unwrap();
    storage.put_call(b).await.unwrap();

    storage
        .put_result(a_id, StoredOutcome::Forward { target: b_id })
        .await
        .unwrap();
    storage
        .put_result(b_id, StoredOutcome::Value { value: json!({"n": 1}) })
        .await
        .unwrap();

    assert_eq!(
        storage.get_result(a_id).await.unwrap(),
        ResultLookup::Forward(b_id)
    );
    assert_eq!(
        storage.get_result(b_id).await.unwrap(),
        ResultLookup::Value(json!({"n": 1}))
    );
    assert_eq!(
        storage.get_call(a_id).await.unwrap().unwrap().status,
        CallStatus::Resolved
    );

    let c = sample_row("c");
    let c_id = c.id;
    storage.put_call(c).await.unwrap();
    storage
        .put_result(
            c_id,
            StoredOutcome::Error {
                error: CallError::execution("boom"),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        storage.get_result(c_id).await.unwrap(),
        ResultLookup::Error(CallError::execution("boom"))
    );
    assert_eq!(
        storage.get_call(c_id).await.unwrap().unwrap().status,
        CallStatus::Failed
    );

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn cas_is_single_winner() {
    let (url, path) = temp_url("mycelia_sqlite_cas.db");
    let storage = SqliteStorage::connect(&url).await.unwrap();

    let row = sample_row("contended");
    let id = row.id;
    storage.put_call(row).await.unwrap();
    storage.set_status(id, CallStatus::Running).await.unwrap();

    let first = storage
        .cas_status(id, CallStatus::Running, CallStatus::Resolved)
        .await
        .unwrap();
    let second = storage
        .cas_status(id, CallStatus::Running, CallStatus::Failed)
        .await
        .unwrap();
    assert!(first);
    assert!(!second);
    assert_eq!(
        storage.get_call(id).await.unwrap().unwrap().status,
        CallStatus::Resolved
    );

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn missing_rows_report_missing() {
    let (url, path) = temp_url("mycelia_sqlite_missing.db");
    let storage = SqliteStorage::connect(&url).await.unwrap();

    let ghost = sample_row("ghost").id;
    assert!(storage.get_call(ghost).await.unwrap().is_none());
    assert_eq!(
        storage.get_result(ghost).await.unwrap(),
        ResultLookup::Missing
    );

    let _ = std::fs::remove_file(&path);
}
