//! Integration tests for advisers: retries, ignored failures, interventions
//! and ending the plan

use crate::integration::test_utils::*;
use cadence::adviser::Advise;
use cadence::execution::Status;
use cadence::interrupt::{InterruptRequest, InterruptState, InterruptType};
use serde_json::json;

#[tokio::test]
async fn test_retry_until_an_attempt_succeeds() {
    let h = Harness::new();
    let pe = h.start(plan(
        "retry",
        "flaky",
        vec![advised(
            node("flaky", "FAIL", "SYNC", json!({ "fail_attempts": 2, "message": "connection reset" })),
            json!([{ "type": "RETRY", "parameters": { "retry_count": 3 } }]),
        )],
    ));
    h.settle().await;

    let attempts = h.attempts(&pe.uuid, "flaky");
    assert_eq!(attempts.len(), 3);
    let statuses: Vec<Status> = attempts.iter().map(|a| a.status).collect();
    assert_eq!(statuses, vec![Status::Failed, Status::Failed, Status::Succeeded]);
    assert!(attempts[0].old_retry && attempts[1].old_retry && !attempts[2].old_retry);
    assert_eq!(
        attempts[2].retry_ids,
        vec![attempts[0].uuid.clone(), attempts[1].uuid.clone()]
    );
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
}

#[tokio::test]
async fn test_exhausted_retries_apply_the_repair_action() {
    let h = Harness::new();
    let pe = h.start(plan(
        "exhausted",
        "broken",
        vec![advised(
            node("broken", "FAIL", "SYNC", json!({ "message": "always" })),
            json!([{
                "type": "RETRY",
                "parameters": { "retry_count": 1, "repair_action_after_retry": "END_EXECUTION" }
            }]),
        )],
    ));
    h.settle().await;

    let attempts = h.attempts(&pe.uuid, "broken");
    assert_eq!(attempts.len(), 2);
    let last = h.node(&pe.uuid, "broken");
    assert_eq!(
        last.advise.unwrap().advise,
        Some(Advise::EndPlan { is_abort: false })
    );
    assert_eq!(h.execution(&pe.uuid).status, Status::Failed);
}

#[tokio::test]
async fn test_retry_waits_between_attempts() {
    let h = Harness::new();
    let pe = h.start(plan(
        "retry-wait",
        "flaky",
        vec![advised(
            node("flaky", "FAIL", "SYNC", json!({ "fail_attempts": 1 })),
            json!([{ "type": "RETRY", "parameters": { "retry_count": 2, "wait_intervals_ms": [30] } }]),
        )],
    ));
    h.settle().await;

    let attempts = h.attempts(&pe.uuid, "flaky");
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].status, Status::Succeeded);
    assert!(attempts[1].start_ts.unwrap() >= attempts[0].end_ts.unwrap() + 30);
}

#[tokio::test]
async fn test_retry_skips_failure_types_it_does_not_cover() {
    let h = Harness::new();
    let pe = h.start(plan(
        "retry-filter",
        "auth",
        vec![advised(
            node("auth", "FAIL", "SYNC", json!({ "failure_types": ["AUTHENTICATION"] })),
            json!([{ "type": "RETRY", "parameters": { "retry_count": 3, "failure_types": ["TIMEOUT"] } }]),
        )],
    ));
    h.settle().await;

    assert_eq!(h.attempts(&pe.uuid, "auth").len(), 1);
    assert_eq!(h.execution(&pe.uuid).status, Status::Failed);
}

#[tokio::test]
async fn test_ignore_failure_marks_success_and_moves_on() {
    let h = Harness::new();
    let pe = h.start(plan(
        "ignore",
        "lint",
        vec![
            advised(
                node("lint", "FAIL", "SYNC", json!({ "message": "style warnings" })),
                json!([{ "type": "IGNORE_FAILURE", "parameters": { "next_node_id": "ship" } }]),
            ),
            node("ship", "NOOP", "SYNC", json!(null)),
        ],
    ));
    h.settle().await;

    let lint = h.node(&pe.uuid, "lint");
    assert_eq!(lint.status, Status::Succeeded);
    assert!(lint.failure_info.is_none());
    assert!(lint.progress.iter().any(|p| p.message == "Marked as success"));
    assert_eq!(h.status(&pe.uuid, "ship"), Status::Succeeded);
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
}

#[tokio::test]
async fn test_intervention_wait_resolved_by_operator() {
    let h = Harness::new();
    let pe = h.start(plan(
        "intervene",
        "gate",
        vec![
            advised(
                node("gate", "FAIL", "SYNC", json!({ "message": "needs approval" })),
                json!([{
                    "type": "INTERVENTION_WAIT",
                    "parameters": { "timeout_ms": 600000, "next_node_id": "after" }
                }]),
            ),
            node("after", "NOOP", "SYNC", json!(null)),
        ],
    ));
    h.settle().await;

    let gate = h.node(&pe.uuid, "gate");
    assert_eq!(gate.status, Status::InterventionWaiting);
    assert_eq!(gate.status_before_intervention, Some(Status::Failed));
    assert_eq!(h.engine.timers().pending_for_node(&gate.uuid).unwrap().len(), 1);

    let interrupt = h
        .interrupt(InterruptRequest::new(InterruptType::MarkSuccess, &pe.uuid).for_node(&gate.uuid))
        .await;
    assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);

    let gate = h.node(&pe.uuid, "gate");
    assert_eq!(gate.status, Status::Succeeded);
    assert_eq!(gate.interrupt_history.len(), 1);
    assert!(h.engine.timers().pending_for_node(&gate.uuid).unwrap().is_empty());
    assert_eq!(h.status(&pe.uuid, "after"), Status::Succeeded);
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
}

#[tokio::test]
async fn test_intervention_timeout_applies_the_repair_action() {
    let h = Harness::new();
    let pe = h.start(plan(
        "intervene-timeout",
        "gate",
        vec![advised(
            node("gate", "FAIL", "SYNC", json!({ "message": "nobody came" })),
            json!([{
                "type": "INTERVENTION_WAIT",
                "parameters": { "timeout_ms": 30, "repair_action": "MARK_AS_SUCCESS" }
            }]),
        )],
    ));
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "gate"), Status::Succeeded);
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
}

#[tokio::test]
async fn test_end_plan_aborts_running_siblings() {
    let h = Harness::new();
    let pe = h.start(plan(
        "end-plan",
        "fork",
        vec![
            node("fork", "FORK", "CHILDREN", json!({ "children": ["slow", "fatal"] })),
            node("slow", "ASYNC", "ASYNC", json!({ "correlation_ids": ["never"] })),
            advised(
                node("fatal", "FAIL", "SYNC", json!({ "message": "corrupt artifact" })),
                json!([{ "type": "END_PLAN" }]),
            ),
        ],
    ));
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "fatal"), Status::Failed);
    assert_eq!(h.status(&pe.uuid, "slow"), Status::Aborted);
    assert_eq!(h.status(&pe.uuid, "fork"), Status::Aborted);
    assert_eq!(h.execution(&pe.uuid).status, Status::Failed);

    // The aborted wait no longer accepts results
    let slow = h.node(&pe.uuid, "slow");
    let waits = h.engine.wait_notify().waits_for_owner(&slow.uuid).unwrap();
    assert!(waits
        .iter()
        .all(|w| w.state == cadence::wait_notify::WaitState::Cancelled));
}

#[tokio::test]
async fn test_misconfigured_manual_intervention_ends_the_branch() {
    let h = Harness::new();
    let pe = h.start(plan(
        "manual",
        "step",
        vec![advised(
            node("step", "FAIL", "SYNC", json!({ "message": "boom" })),
            json!([{ "type": "MANUAL_INTERVENTION", "parameters": { "timeout_ms": 600000 } }]),
        )],
    ));
    h.settle().await;

    let step = h.node(&pe.uuid, "step");
    assert_eq!(step.status, Status::Failed);
    assert_eq!(step.advise.unwrap().advise, None);
    assert_eq!(h.execution(&pe.uuid).status, Status::Failed);
}

#[tokio::test]
async fn test_first_applicable_adviser_wins() {
    let h = Harness::new();
    let pe = h.start(plan(
        "order",
        "step",
        vec![advised(
            node("step", "FAIL", "SYNC", json!({ "failure_types": ["TIMEOUT"] })),
            json!([
                { "type": "NEXT_STEP", "parameters": { "next_node_id": "never" } },
                { "type": "IGNORE_FAILURE", "parameters": { "failure_types": ["TIMEOUT"] } },
                { "type": "END_PLAN" }
            ]),
        )],
    ));
    h.settle().await;

    let step = h.node(&pe.uuid, "step");
    let record = step.advise.unwrap();
    assert_eq!(record.adviser.as_deref(), Some("IGNORE_FAILURE"));
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
}

#[tokio::test]
async fn test_retried_async_node_waits_for_a_fresh_notify() {
    let h = Harness::new();
    let pe = h.start(plan(
        "retry-async",
        "callback",
        vec![advised(
            node("callback", "ASYNC", "ASYNC", json!({ "correlation_ids": ["x"] })),
            json!([{ "type": "RETRY", "parameters": { "retry_count": 3 } }]),
        )],
    ));
    h.settle().await;

    h.engine.notify("x", json!("boom"), true).unwrap();
    h.settle().await;

    // One failure costs one attempt; the next one waits for its own result
    let attempts = h.attempts(&pe.uuid, "callback");
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].status, Status::Failed);
    assert_eq!(attempts[1].status, Status::AsyncWaiting);
    assert_eq!(h.execution(&pe.uuid).status, Status::Running);

    let outcome = h.engine.notify("x", json!({ "ok": true }), false).unwrap();
    assert_eq!(outcome, cadence::wait_notify::NotifyOutcome::Delivered);
    h.settle().await;

    let attempts = h.attempts(&pe.uuid, "callback");
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].status, Status::Succeeded);
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
}
