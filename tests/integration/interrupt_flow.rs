//! Integration tests for operator interrupts

use crate::integration::test_utils::*;
use cadence::execution::{FailureType, Status};
use cadence::interrupt::{InterruptRequest, InterruptState, InterruptType};
use cadence::wait_notify::WaitState;
use serde_json::json;

fn waiting_plan(uuid: &str, correlation_id: &str) -> cadence::plan::Plan {
    plan(
        uuid,
        "wait",
        vec![node("wait", "ASYNC", "ASYNC", json!({ "correlation_ids": [correlation_id] }))],
    )
}

fn rejection(state: &InterruptState) -> &str {
    match state {
        InterruptState::ProcessedUnsuccessfully { reason } => reason,
        other => panic!("expected a rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pause_defers_results_until_resume() {
    let h = Harness::new();
    let pe = h.start(waiting_plan("pause", "artifact"));
    h.settle().await;

    let paused = h.interrupt(InterruptRequest::new(InterruptType::Pause, &pe.uuid)).await;
    assert_eq!(paused.state, InterruptState::ProcessedSuccessfully);
    assert!(h.execution(&pe.uuid).paused);
    let wait = h.node(&pe.uuid, "wait");
    assert_eq!(wait.status, Status::Paused);
    assert_eq!(wait.status_before_pause, Some(Status::AsyncWaiting));

    // The result arrives while paused and is held on the node
    h.engine.notify("artifact", json!({ "sha": "abc" }), false).unwrap();
    h.settle().await;
    let wait = h.node(&pe.uuid, "wait");
    assert_eq!(wait.status, Status::Paused);
    assert!(wait.deferred_responses.is_some());

    let resumed = h.interrupt(InterruptRequest::new(InterruptType::Resume, &pe.uuid)).await;
    assert_eq!(resumed.state, InterruptState::ProcessedSuccessfully);
    assert!(!h.execution(&pe.uuid).paused);

    let wait = h.node(&pe.uuid, "wait");
    assert_eq!(wait.status, Status::Succeeded);
    assert_eq!(wait.interrupt_history.len(), 2);
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
}

#[tokio::test]
async fn test_pause_holds_a_node_that_has_not_started() {
    let h = Harness::new();
    let pe = h.start(plan(
        "pause-queued",
        "first",
        vec![
            then(node("first", "NOOP", "SYNC", json!(null)), "second"),
            node("second", "NOOP", "SYNC", json!(null)),
        ],
    ));

    // Interrupts are handled ahead of the queued start
    h.interrupt(InterruptRequest::new(InterruptType::Pause, &pe.uuid)).await;
    let first = h.node(&pe.uuid, "first");
    assert_eq!(first.status, Status::Paused);
    assert_eq!(first.status_before_pause, Some(Status::Queued));
    assert!(first.start_ts.is_none());

    h.interrupt(InterruptRequest::new(InterruptType::Resume, &pe.uuid)).await;
    assert_eq!(h.status(&pe.uuid, "first"), Status::Succeeded);
    assert_eq!(h.status(&pe.uuid, "second"), Status::Succeeded);
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
}

#[tokio::test]
async fn test_abort_node_cancels_its_waits() {
    let h = Harness::new();
    let pe = h.start(waiting_plan("abort", "never"));
    h.settle().await;
    let wait = h.node(&pe.uuid, "wait");

    let interrupt = h
        .interrupt(
            InterruptRequest::new(InterruptType::Abort, &pe.uuid)
                .for_node(&wait.uuid)
                .with_reason("wrong branch")
                .issued_by("ops"),
        )
        .await;
    assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);
    assert_eq!(interrupt.issued_by.as_deref(), Some("ops"));
    assert!(interrupt.processed_at.is_some());

    let wait = h.node(&pe.uuid, "wait");
    assert_eq!(wait.status, Status::Aborted);
    assert_eq!(wait.failure_info.unwrap().failure_types, vec![FailureType::UserMarked]);
    let waits = h.engine.wait_notify().waits_for_owner(&wait.uuid).unwrap();
    assert!(waits.iter().all(|w| w.state == WaitState::Cancelled));
    assert_eq!(h.execution(&pe.uuid).status, Status::Aborted);
}

#[tokio::test]
async fn test_abort_all_ends_every_branch() {
    let h = Harness::new();
    let pe = h.start(plan(
        "abort-all",
        "fork",
        vec![
            node("fork", "FORK", "CHILDREN", json!({ "children": ["one", "two"] })),
            node("one", "ASYNC", "ASYNC", json!({ "correlation_ids": ["c1"] })),
            node("two", "ASYNC", "ASYNC", json!({ "correlation_ids": ["c2"] })),
        ],
    ));
    h.settle().await;

    let interrupt = h.interrupt(InterruptRequest::new(InterruptType::AbortAll, &pe.uuid)).await;
    assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);
    assert!(h.nodes(&pe.uuid).iter().all(|n| n.status == Status::Aborted));
    assert_eq!(h.execution(&pe.uuid).status, Status::Aborted);

    // Late results find nothing waiting
    h.engine.notify("c1", json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.status(&pe.uuid, "one"), Status::Aborted);
}

#[tokio::test]
async fn test_expire_all_expires_live_leaves() {
    let h = Harness::new();
    let pe = h.start(waiting_plan("expire", "slow"));
    h.settle().await;

    let interrupt = h.interrupt(InterruptRequest::new(InterruptType::ExpireAll, &pe.uuid)).await;
    assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);

    let wait = h.node(&pe.uuid, "wait");
    assert_eq!(wait.status, Status::Expired);
    assert_eq!(wait.failure_info.unwrap().failure_types, vec![FailureType::Timeout]);
    assert_eq!(h.execution(&pe.uuid).status, Status::Expired);
}

#[tokio::test]
async fn test_custom_failure_uses_metadata() {
    let h = Harness::new();
    let pe = h.start(waiting_plan("custom", "scan"));
    h.settle().await;
    let wait = h.node(&pe.uuid, "wait");

    h.interrupt(
        InterruptRequest::new(InterruptType::CustomFailure, &pe.uuid)
            .for_node(&wait.uuid)
            .with_metadata(json!({ "message": "policy violated", "failure_types": ["POLICY_EVALUATION"] })),
    )
    .await;

    let wait = h.node(&pe.uuid, "wait");
    assert_eq!(wait.status, Status::Failed);
    let failure = wait.failure_info.unwrap();
    assert_eq!(failure.message, "policy violated");
    assert_eq!(failure.failure_types, vec![FailureType::PolicyEvaluation]);
    assert_eq!(h.execution(&pe.uuid).status, Status::Failed);
}

#[tokio::test]
async fn test_retry_from_intervention_starts_a_new_attempt() {
    let h = Harness::new();
    let pe = h.start(plan(
        "retry-iw",
        "flaky",
        vec![advised(
            node("flaky", "FAIL", "SYNC", json!({ "fail_attempts": 1 })),
            json!([{ "type": "INTERVENTION_WAIT", "parameters": { "timeout_ms": 600000 } }]),
        )],
    ));
    h.settle().await;
    let first = h.node(&pe.uuid, "flaky");
    assert_eq!(first.status, Status::InterventionWaiting);

    let interrupt = h
        .interrupt(InterruptRequest::new(InterruptType::Retry, &pe.uuid).for_node(&first.uuid))
        .await;
    assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);

    let attempts = h.attempts(&pe.uuid, "flaky");
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].status, Status::Failed);
    assert!(attempts[0].old_retry);
    assert_eq!(attempts[1].status, Status::Succeeded);
    assert!(h.engine.timers().pending_for_node(&first.uuid).unwrap().is_empty());
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
}

#[tokio::test]
async fn test_mark_success_needs_an_intervention_wait() {
    let h = Harness::new();
    let pe = h.start(waiting_plan("not-iw", "x"));
    h.settle().await;
    let wait = h.node(&pe.uuid, "wait");

    let interrupt = h
        .interrupt(InterruptRequest::new(InterruptType::MarkSuccess, &pe.uuid).for_node(&wait.uuid))
        .await;
    assert!(rejection(&interrupt.state).contains("not waiting for intervention"));
    assert_eq!(h.status(&pe.uuid, "wait"), Status::AsyncWaiting);
}

#[tokio::test]
async fn test_mark_failed_ends_the_branch_as_failed() {
    let h = Harness::new();
    let pe = h.start(plan(
        "mark-failed",
        "gate",
        vec![advised(
            node("gate", "FAIL", "SYNC", json!(null)),
            json!([{ "type": "INTERVENTION_WAIT", "parameters": { "timeout_ms": 600000 } }]),
        )],
    ));
    h.settle().await;
    let gate = h.node(&pe.uuid, "gate");

    h.interrupt(InterruptRequest::new(InterruptType::MarkFailed, &pe.uuid).for_node(&gate.uuid))
        .await;
    assert_eq!(h.status(&pe.uuid, "gate"), Status::Failed);
    assert_eq!(h.execution(&pe.uuid).status, Status::Failed);
}

#[tokio::test]
async fn test_interrupt_on_finished_plan_is_rejected() {
    let h = Harness::new();
    let pe = h.start(plan("done", "a", vec![node("a", "NOOP", "SYNC", json!(null))]));
    h.settle().await;

    let interrupt = h.interrupt(InterruptRequest::new(InterruptType::AbortAll, &pe.uuid)).await;
    assert!(rejection(&interrupt.state).contains("already ended"));
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);

    let recorded = h.engine.interrupts().store().for_plan_execution(&pe.uuid).unwrap();
    assert_eq!(recorded.len(), 1);
}

#[tokio::test]
async fn test_scope_is_checked_at_registration() {
    let h = Harness::new();
    let missing_node = h
        .engine
        .register_interrupt(InterruptRequest::new(InterruptType::Abort, "pe-1"));
    assert!(missing_node.is_err());

    let plan_wide = h
        .engine
        .register_interrupt(InterruptRequest::new(InterruptType::ExpireAll, "pe-1").for_node("n-1"));
    assert!(plan_wide.is_err());
}

/// `group` sits beside `other` under `root`; inside it `lock` takes
/// `env-slot` with the given scope and hands on to `work`.
fn subtree_plan(uuid: &str, holding_scope: &str) -> cadence::plan::Plan {
    plan(
        uuid,
        "root",
        vec![
            node("root", "FORK", "CHILDREN", json!({ "children": ["group", "other"] })),
            node("group", "FORK", "CHILDREN", json!({ "children": ["lock"] })),
            then(
                node(
                    "lock",
                    "NOOP",
                    "RESOURCE_RESTRAINT",
                    json!({ "resource_unit": "env-slot", "holding_scope": holding_scope }),
                ),
                "work",
            ),
            node("work", "ASYNC", "ASYNC", json!({ "correlation_ids": [format!("{}-work", uuid)] })),
            node("other", "ASYNC", "ASYNC", json!({ "correlation_ids": [format!("{}-other", uuid)] })),
        ],
    )
}

fn plan_holder(uuid: &str, done: &str) -> cadence::plan::Plan {
    plan(
        uuid,
        "lock",
        vec![
            then(
                node(
                    "lock",
                    "NOOP",
                    "RESOURCE_RESTRAINT",
                    json!({ "resource_unit": "env-slot", "holding_scope": "plan" }),
                ),
                "hold",
            ),
            node("hold", "ASYNC", "ASYNC", json!({ "correlation_ids": [done] })),
        ],
    )
}

#[tokio::test]
async fn test_abort_subtree_releases_its_hold() {
    let h = Harness::new();
    let pe = h.start(subtree_plan("subtree", "parent"));
    h.settle().await;
    let group = h.node(&pe.uuid, "group");
    assert_eq!(h.status(&pe.uuid, "lock"), Status::Succeeded);
    assert_eq!(h.status(&pe.uuid, "work"), Status::AsyncWaiting);
    let holders = h.engine.restraints().holders("env-slot").unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].release_entity_id, group.uuid);

    let next = h.start(plan_holder("next", "next-done"));
    h.settle().await;
    assert_eq!(h.status(&next.uuid, "lock"), Status::ResourceWaiting);

    let interrupt = h
        .interrupt(InterruptRequest::new(InterruptType::Abort, &pe.uuid).for_node(&group.uuid))
        .await;
    assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);

    let work = h.node(&pe.uuid, "work");
    let group = h.node(&pe.uuid, "group");
    assert_eq!(work.status, Status::Aborted);
    assert_eq!(group.status, Status::Aborted);
    assert_eq!(h.status(&pe.uuid, "lock"), Status::Succeeded);
    assert!(work.end_ts.unwrap() <= group.end_ts.unwrap());
    for owner in [&work.uuid, &group.uuid] {
        let waits = h.engine.wait_notify().waits_for_owner(owner).unwrap();
        assert!(!waits.is_empty());
        assert!(waits.iter().all(|w| w.state == WaitState::Cancelled));
    }

    // The hold went with the subtree and the next plan got the slot
    assert_eq!(h.status(&next.uuid, "lock"), Status::Succeeded);
    assert_eq!(h.status(&next.uuid, "hold"), Status::AsyncWaiting);
    let holders = h.engine.restraints().holders("env-slot").unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].release_entity_id, next.uuid);

    // The rest of the plan carries on
    assert_eq!(h.status(&pe.uuid, "other"), Status::AsyncWaiting);
    assert_eq!(h.execution(&pe.uuid).status, Status::Running);
    h.engine.notify("subtree-work", json!({}), false).unwrap();
    h.engine.notify("subtree-other", json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.status(&pe.uuid, "work"), Status::Aborted);
    assert_eq!(h.execution(&pe.uuid).status, Status::Aborted);
}

#[tokio::test]
async fn test_abort_subtree_withdraws_a_blocked_request() {
    let h = Harness::new();
    let holder = h.start(plan_holder("holder", "holder-done"));
    h.settle().await;
    let pe = h.start(subtree_plan("blocked-subtree", "plan"));
    h.settle().await;
    assert_eq!(h.status(&pe.uuid, "lock"), Status::ResourceWaiting);
    assert_eq!(h.engine.restraints().holders("env-slot").unwrap().len(), 2);

    let group = h.node(&pe.uuid, "group");
    h.interrupt(InterruptRequest::new(InterruptType::Abort, &pe.uuid).for_node(&group.uuid))
        .await;
    assert_eq!(h.status(&pe.uuid, "lock"), Status::Aborted);
    assert_eq!(h.status(&pe.uuid, "group"), Status::Aborted);
    assert_eq!(h.execution(&pe.uuid).status, Status::Running);

    let holders = h.engine.restraints().holders("env-slot").unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].release_entity_id, holder.uuid);

    // Releasing the holder promotes no one on behalf of the aborted node
    h.engine.notify("holder-done", json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.execution(&holder.uuid).status, Status::Succeeded);
    assert!(h.engine.restraints().holders("env-slot").unwrap().is_empty());
    assert!(h.attempts(&pe.uuid, "work").is_empty());
}
