//! Integration tests for state surviving an engine restart on sled storage

use crate::integration::test_utils::*;
use cadence::config::CadenceConfig;
use cadence::dispatch::RecordingDispatcher;
use cadence::execution::Status;
use cadence::store::Storage;
use cadence::wait_notify::NotifyOutcome;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn open(path: &Path) -> Harness {
    let storage = Storage::open(path).unwrap();
    // No task queue: nothing outlives the harness and holds the database
    Harness::on_storage(storage, CadenceConfig::default(), |b| {
        b.with_dispatcher(Arc::new(RecordingDispatcher::new()))
    })
}

#[tokio::test]
async fn test_finished_plan_is_readable_after_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("db");

    let plan_execution_id = {
        let h = open(&db);
        let pe = h.start(plan(
            "persisted",
            "a",
            vec![
                then(node("a", "ECHO", "SYNC", json!({ "outputs": { "version": "1.2.3" } })), "b"),
                node("b", "NOOP", "SYNC", json!(null)),
            ],
        ));
        h.settle().await;
        assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
        h.engine.storage().flush().unwrap();
        pe.uuid
    };

    let h = open(&db);
    let execution = h.execution(&plan_execution_id);
    assert_eq!(execution.status, Status::Succeeded);
    assert!(execution.end_ts.is_some());
    assert_eq!(h.nodes(&plan_execution_id).len(), 2);
    assert_eq!(h.engine.plans().get("persisted").unwrap().nodes.len(), 2);
}

#[tokio::test]
async fn test_waiting_node_resumes_after_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("db");

    let plan_execution_id = {
        let h = open(&db);
        let pe = h.start(plan(
            "resumable",
            "wait",
            vec![
                then(
                    node("wait", "ASYNC", "ASYNC", json!({ "correlation_ids": ["approval-7"] })),
                    "after",
                ),
                node("after", "NOOP", "SYNC", json!(null)),
            ],
        ));
        h.settle().await;
        assert_eq!(h.status(&pe.uuid, "wait"), Status::AsyncWaiting);
        h.engine.storage().flush().unwrap();
        pe.uuid
    };

    // A fresh engine finds the registered wait and carries on
    let h = open(&db);
    let outcome = h.engine.notify("approval-7", json!({ "approved": true }), false).unwrap();
    assert_eq!(outcome, NotifyOutcome::Delivered);
    h.settle().await;

    assert_eq!(h.status(&plan_execution_id, "wait"), Status::Succeeded);
    assert_eq!(h.status(&plan_execution_id, "after"), Status::Succeeded);
    assert_eq!(h.execution(&plan_execution_id).status, Status::Succeeded);
}
