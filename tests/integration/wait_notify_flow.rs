//! Integration tests for waits: external notifies, dispatched tasks and chains

use crate::integration::test_utils::*;
use cadence::config::CadenceConfig;
use cadence::dispatch::RecordingDispatcher;
use cadence::execution::{ExecutableResponse, Status};
use cadence::wait_notify::{NotifyOutcome, WaitState};
use serde_json::json;
use std::sync::Arc;

fn async_plan(uuid: &str, correlation_id: &str) -> cadence::plan::Plan {
    plan(
        uuid,
        "wait",
        vec![node("wait", "ASYNC", "ASYNC", json!({ "correlation_ids": [correlation_id] }))],
    )
}

#[tokio::test]
async fn test_async_node_waits_for_notify() {
    let h = Harness::new();
    let pe = h.start(async_plan("async", "deploy-42"));
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "wait"), Status::AsyncWaiting);
    assert!(!h.execution(&pe.uuid).is_final());

    let outcome = h.engine.notify("deploy-42", json!({ "digest": "sha256:ab" }), false).unwrap();
    assert_eq!(outcome, NotifyOutcome::Delivered);
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "wait"), Status::Succeeded);
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
    let wait = h.node(&pe.uuid, "wait");
    let outcomes = h.engine.outcomes().at_level(&pe.uuid, &wait.uuid).unwrap();
    assert_eq!(outcomes[0].name, "digest");
    assert_eq!(outcomes[0].value, json!("sha256:ab"));
}

#[tokio::test]
async fn test_notify_before_register_is_buffered() {
    let h = Harness::new();
    let outcome = h.engine.notify("early", json!({ "ok": true }), false).unwrap();
    assert_eq!(outcome, NotifyOutcome::Buffered);
    assert_eq!(h.engine.wait_notify().buffered_count().unwrap(), 1);

    let pe = h.start(async_plan("early", "early"));
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "wait"), Status::Succeeded);
    assert_eq!(h.engine.wait_notify().buffered_count().unwrap(), 0);
}

#[tokio::test]
async fn test_second_notify_is_a_duplicate() {
    let h = Harness::new();
    let pe = h.start(async_plan("dup", "once"));
    h.settle().await;

    h.engine.notify("once", json!({ "n": 1 }), false).unwrap();
    let again = h.engine.notify("once", json!({ "n": 2 }), false).unwrap();
    assert_eq!(again, NotifyOutcome::Duplicate);
    h.settle().await;

    let wait = h.node(&pe.uuid, "wait");
    let outcomes = h.engine.outcomes().at_level(&pe.uuid, &wait.uuid).unwrap();
    assert_eq!(outcomes[0].value, json!(1));
}

#[tokio::test]
async fn test_error_notify_fails_the_node() {
    let h = Harness::new();
    let pe = h.start(async_plan("err", "job"));
    h.settle().await;

    h.engine.notify("job", json!({ "message": "disk full" }), true).unwrap();
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "wait"), Status::Failed);
    assert_eq!(h.execution(&pe.uuid).status, Status::Failed);
}

#[tokio::test]
async fn test_task_runs_on_the_queue() {
    let h = Harness::new();
    let pe = h.start(plan(
        "task",
        "build",
        vec![node(
            "build",
            "TASK",
            "TASK",
            json!({ "task": { "task_type": "docker_build", "payload": { "image": "app:1" } } }),
        )],
    ));
    h.settle().await;

    let build = h.node(&pe.uuid, "build");
    assert_eq!(build.status, Status::Succeeded);
    assert!(matches!(
        &build.executable_responses[0],
        ExecutableResponse::Task { task_type, .. } if task_type == "docker_build"
    ));
    let outcomes = h.engine.outcomes().at_level(&pe.uuid, &build.uuid).unwrap();
    assert_eq!(outcomes[0].value, json!("app:1"));
}

#[tokio::test]
async fn test_failed_task_fails_the_node() {
    let h = Harness::new();
    let pe = h.start(plan(
        "task-fail",
        "build",
        vec![node(
            "build",
            "TASK",
            "TASK",
            json!({ "task": { "task_type": "docker_build", "payload": { "fail": "no space left" } } }),
        )],
    ));
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "build"), Status::Failed);
    assert_eq!(h.execution(&pe.uuid).status, Status::Failed);
}

#[tokio::test]
async fn test_task_is_dispatched_once_per_attempt() {
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let h = Harness::with(CadenceConfig::default(), |b| b.with_dispatcher(dispatcher.clone()));
    let pe = h.start(plan(
        "external",
        "build",
        vec![node(
            "build",
            "TASK",
            "TASK",
            json!({ "task": { "task_type": "remote", "payload": {} } }),
        )],
    ));
    h.settle().await;

    let build = h.node(&pe.uuid, "build");
    assert_eq!(build.status, Status::TaskWaiting);
    let requests = dispatcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].node_execution_id, build.uuid);

    // A redelivered start finds the node claimed
    h.engine.start_node(&build.uuid).await.unwrap();
    assert_eq!(dispatcher.requests().len(), 1);

    h.engine
        .notify(&requests[0].correlation_id, json!({ "exit_code": 0 }), false)
        .unwrap();
    h.settle().await;
    assert_eq!(h.status(&pe.uuid, "build"), Status::Succeeded);
}

#[tokio::test]
async fn test_task_chain_runs_links_in_order() {
    let h = Harness::new();
    let pe = h.start(plan(
        "task-chain",
        "deploy",
        vec![node(
            "deploy",
            "TASK_CHAIN",
            "TASK_CHAIN",
            json!({ "tasks": [
                { "task_type": "fetch", "payload": { "manifest": "m1" } },
                { "task_type": "apply", "payload": { "applied": true } }
            ] }),
        )],
    ));
    h.settle().await;

    let deploy = h.node(&pe.uuid, "deploy");
    assert_eq!(deploy.status, Status::Succeeded);
    assert_eq!(deploy.executable_responses.len(), 2);
    match &deploy.executable_responses[1] {
        ExecutableResponse::TaskChain {
            task_type,
            chain_end,
            pass_through,
            ..
        } => {
            assert_eq!(task_type, "apply");
            assert!(*chain_end);
            // The first link's result rides along to the second
            let previous: Vec<_> = pass_through.as_object().unwrap().values().collect();
            assert_eq!(previous, vec![&json!({ "manifest": "m1" })]);
        }
        other => panic!("unexpected response {:?}", other),
    }
}

#[tokio::test]
async fn test_task_chain_stops_at_a_failed_link() {
    let h = Harness::new();
    let pe = h.start(plan(
        "task-chain-fail",
        "deploy",
        vec![node(
            "deploy",
            "TASK_CHAIN",
            "TASK_CHAIN",
            json!({ "tasks": [
                { "task_type": "fetch", "payload": { "fail": "404" } },
                { "task_type": "apply", "payload": {} }
            ] }),
        )],
    ));
    h.settle().await;

    let deploy = h.node(&pe.uuid, "deploy");
    assert_eq!(deploy.status, Status::Failed);
    assert_eq!(deploy.executable_responses.len(), 1);
}

#[tokio::test]
async fn test_wait_fires_once_all_ids_are_notified() {
    let h = Harness::new();
    let pe = h.start(plan(
        "all-ids",
        "wait",
        vec![node("wait", "ASYNC", "ASYNC", json!({ "correlation_ids": ["left", "right"] }))],
    ));
    h.settle().await;
    let wait = h.node(&pe.uuid, "wait");
    let waits = h.engine.wait_notify().waits_for_owner(&wait.uuid).unwrap();
    assert_eq!(waits.len(), 1);
    assert_eq!(waits[0].state, WaitState::Waiting);

    h.engine.notify("left", json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.status(&pe.uuid, "wait"), Status::AsyncWaiting);

    h.engine.notify("right", json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.status(&pe.uuid, "wait"), Status::Succeeded);
    let waits = h.engine.wait_notify().waits_for_owner(&wait.uuid).unwrap();
    assert_eq!(waits[0].state, WaitState::Fired);
}
