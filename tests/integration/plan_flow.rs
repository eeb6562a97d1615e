//! Integration tests for walking plans: sequences, child branches and outputs

use crate::integration::test_utils::*;
use cadence::execution::{ExecutableResponse, Status};
use cadence::interrupt::{InterruptRequest, InterruptState, InterruptType};
use cadence::outputs::RefObject;
use serde_json::json;

#[tokio::test]
async fn test_sequence_runs_to_success() {
    let h = Harness::new();
    let pe = h.start(plan(
        "seq",
        "a",
        vec![
            then(node("a", "NOOP", "SYNC", json!(null)), "b"),
            node("b", "NOOP", "SYNC", json!(null)),
        ],
    ));
    h.settle().await;

    let execution = h.execution(&pe.uuid);
    assert_eq!(execution.status, Status::Succeeded);
    assert!(execution.end_ts.is_some());

    let a = h.node(&pe.uuid, "a");
    let b = h.node(&pe.uuid, "b");
    assert_eq!(a.status, Status::Succeeded);
    assert_eq!(b.status, Status::Succeeded);
    assert_eq!(a.next_id.as_deref(), Some(b.uuid.as_str()));
    assert_eq!(b.previous_id.as_deref(), Some(a.uuid.as_str()));
    // Siblings sit at the same depth
    assert_eq!(a.context.depth(), b.context.depth());
}

#[tokio::test]
async fn test_failure_without_adviser_fails_the_plan() {
    let h = Harness::new();
    let pe = h.start(plan(
        "fail",
        "a",
        vec![
            then(node("a", "FAIL", "SYNC", json!({ "message": "exit 1" })), "b"),
            node("b", "NOOP", "SYNC", json!(null)),
        ],
    ));
    h.settle().await;

    assert_eq!(h.execution(&pe.uuid).status, Status::Failed);
    let a = h.node(&pe.uuid, "a");
    assert_eq!(a.failure_info.unwrap().message, "exit 1");
    // NEXT_STEP only advises positive outcomes
    assert!(h.attempts(&pe.uuid, "b").is_empty());
}

#[tokio::test]
async fn test_children_aggregate_to_failed() {
    let h = Harness::new();
    let pe = h.start(plan(
        "fork",
        "fork",
        vec![
            node("fork", "FORK", "CHILDREN", json!({ "children": ["ok", "bad"] })),
            node("ok", "NOOP", "SYNC", json!(null)),
            node("bad", "FAIL", "SYNC", json!({ "failure_types": ["VERIFICATION"] })),
        ],
    ));
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "ok"), Status::Succeeded);
    assert_eq!(h.status(&pe.uuid, "bad"), Status::Failed);

    let fork = h.node(&pe.uuid, "fork");
    assert_eq!(fork.status, Status::Failed);
    let failure = fork.failure_info.unwrap();
    assert_eq!(failure.message, "1 of 2 child branches did not succeed");
    assert_eq!(failure.failure_types, vec![cadence::execution::FailureType::Verification]);
    assert_eq!(h.execution(&pe.uuid).status, Status::Failed);

    // Children hang one level below their parent
    let ok = h.node(&pe.uuid, "ok");
    assert_eq!(ok.parent_id.as_deref(), Some(fork.uuid.as_str()));
    assert_eq!(ok.context.depth(), fork.context.depth() + 1);
}

#[tokio::test]
async fn test_bounded_concurrency_starts_children_one_at_a_time() {
    let h = Harness::new();
    let pe = h.start(plan(
        "bounded",
        "fork",
        vec![
            node(
                "fork",
                "FORK",
                "CHILDREN",
                json!({ "children": ["first", "second", "third"], "max_concurrency": 1 }),
            ),
            node("first", "ASYNC", "ASYNC", json!({ "correlation_ids": ["c-first"] })),
            node("second", "ASYNC", "ASYNC", json!({ "correlation_ids": ["c-second"] })),
            node("third", "ASYNC", "ASYNC", json!({ "correlation_ids": ["c-third"] })),
        ],
    ));
    h.settle().await;
    assert_eq!(h.status(&pe.uuid, "first"), Status::AsyncWaiting);
    assert_eq!(h.status(&pe.uuid, "second"), Status::Queued);
    assert_eq!(h.status(&pe.uuid, "third"), Status::Queued);

    h.engine.notify("c-first", json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.status(&pe.uuid, "first"), Status::Succeeded);
    assert_eq!(h.status(&pe.uuid, "second"), Status::AsyncWaiting);
    assert_eq!(h.status(&pe.uuid, "third"), Status::Queued);

    h.engine.notify("c-second", json!({}), false).unwrap();
    h.settle().await;
    h.engine.notify("c-third", json!({}), false).unwrap();
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "fork"), Status::Succeeded);
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
}

fn bounded_fork(uuid: &str, max_concurrency: usize, children: &[&str]) -> cadence::plan::Plan {
    let mut nodes = vec![node(
        "fork",
        "FORK",
        "CHILDREN",
        json!({ "children": children, "max_concurrency": max_concurrency }),
    )];
    for child in children {
        nodes.push(node(child, "ASYNC", "ASYNC", json!({ "correlation_ids": [format!("c-{}", child)] })));
    }
    plan(uuid, "fork", nodes)
}

#[tokio::test]
async fn test_child_ended_before_its_turn_does_not_open_a_slot() {
    let h = Harness::new();
    let pe = h.start(bounded_fork("bounded-abort", 1, &["first", "second", "third"]));
    h.settle().await;
    let third = h.node(&pe.uuid, "third");
    assert_eq!(third.status, Status::Queued);

    let interrupt = h
        .interrupt(InterruptRequest::new(InterruptType::Abort, &pe.uuid).for_node(&third.uuid))
        .await;
    assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);
    assert_eq!(h.status(&pe.uuid, "first"), Status::AsyncWaiting);
    assert_eq!(h.status(&pe.uuid, "second"), Status::Queued);
    assert_eq!(h.status(&pe.uuid, "third"), Status::Aborted);

    h.engine.notify("c-first", json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.status(&pe.uuid, "second"), Status::AsyncWaiting);

    h.engine.notify("c-second", json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.status(&pe.uuid, "second"), Status::Succeeded);
    assert_eq!(h.status(&pe.uuid, "third"), Status::Aborted);
    assert!(h.attempts(&pe.uuid, "third").iter().all(|a| a.start_ts.is_none()));
    assert_eq!(h.status(&pe.uuid, "fork"), Status::Aborted);
    assert_eq!(h.execution(&pe.uuid).status, Status::Aborted);
}

#[tokio::test]
async fn test_reports_arriving_together_release_distinct_children() {
    let h = Harness::new();
    let pe = h.start(bounded_fork("bounded-burst", 2, &["a", "b", "c", "d", "e"]));
    h.settle().await;
    assert_eq!(h.status(&pe.uuid, "a"), Status::AsyncWaiting);
    assert_eq!(h.status(&pe.uuid, "b"), Status::AsyncWaiting);
    assert_eq!(h.status(&pe.uuid, "c"), Status::Queued);

    // Both reports are in before either is handled
    h.engine.notify("c-a", json!({}), false).unwrap();
    h.engine.notify("c-b", json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.status(&pe.uuid, "c"), Status::AsyncWaiting);
    assert_eq!(h.status(&pe.uuid, "d"), Status::AsyncWaiting);
    assert_eq!(h.status(&pe.uuid, "e"), Status::Queued);

    let fork = h.node(&pe.uuid, "fork");
    match fork.executable_responses.last() {
        Some(ExecutableResponse::Children { started, .. }) => assert_eq!(*started, 4),
        other => panic!("expected a children response, got {:?}", other),
    }

    for id in ["c-c", "c-d", "c-e"] {
        h.engine.notify(id, json!({}), false).unwrap();
        h.settle().await;
    }
    assert_eq!(h.status(&pe.uuid, "fork"), Status::Succeeded);
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
}

#[tokio::test]
async fn test_matrix_strategy_spawns_one_child_per_combination() {
    let h = Harness::new();
    let pe = h.start(plan(
        "matrix",
        "strategy",
        vec![
            node(
                "strategy",
                "STRATEGY",
                "CHILDREN",
                json!({ "child": "build", "matrix": { "os": ["linux", "mac"], "arch": ["x86"] } }),
            ),
            node("build", "NOOP", "SYNC", json!(null)),
        ],
    ));
    h.settle().await;

    let builds = h.attempts(&pe.uuid, "build");
    assert_eq!(builds.len(), 2);
    assert!(builds.iter().all(|b| b.status == Status::Succeeded));
    assert!(builds.iter().all(|b| b.identifier.starts_with("build")));
    assert_ne!(builds[0].identifier, builds[1].identifier);

    let strategy = h.node(&pe.uuid, "strategy");
    match &strategy.executable_responses[0] {
        ExecutableResponse::Children { children, .. } => assert_eq!(children.len(), 2),
        other => panic!("unexpected response {:?}", other),
    }
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);
}

#[tokio::test]
async fn test_child_chain_runs_children_in_order() {
    let h = Harness::new();
    let pe = h.start(plan(
        "chain",
        "chain",
        vec![
            node("chain", "CHILD_CHAIN", "CHILD_CHAIN", json!({ "children": ["one", "two"] })),
            node("one", "NOOP", "SYNC", json!(null)),
            node("two", "NOOP", "SYNC", json!(null)),
        ],
    ));
    h.settle().await;

    let one = h.node(&pe.uuid, "one");
    let two = h.node(&pe.uuid, "two");
    assert_eq!(one.status, Status::Succeeded);
    assert_eq!(two.status, Status::Succeeded);
    assert!(one.end_ts.unwrap() <= two.start_ts.unwrap());

    let chain = h.node(&pe.uuid, "chain");
    assert_eq!(chain.status, Status::Succeeded);
    assert_eq!(chain.executable_responses.len(), 2);
}

#[tokio::test]
async fn test_sweeping_output_visible_to_later_sibling() {
    let h = Harness::new();
    let pe = h.start(plan(
        "outputs",
        "stage",
        vec![
            in_group(node("stage", "SECTION", "CHILD", json!({ "child": "writer" })), "STAGE"),
            then(
                node(
                    "writer",
                    "ECHO",
                    "SYNC",
                    json!({ "outputs": { "artifact": "registry/app:1" }, "group": "STAGE" }),
                ),
                "reader",
            ),
            node("reader", "ECHO", "SYNC", json!({ "resolve": ["artifact"] })),
        ],
    ));
    h.settle().await;

    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);

    let stage = h.node(&pe.uuid, "stage");
    let reader = h.node(&pe.uuid, "reader");
    let written = h.engine.sweeping_outputs().at_level(&pe.uuid, &stage.uuid).unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].name, "artifact");

    let outcomes = h.engine.outcomes().at_level(&pe.uuid, &reader.uuid).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].value, json!("registry/app:1"));

    // Not visible from a context that never entered the stage
    let outside = h
        .engine
        .sweeping_outputs()
        .resolve_optional(&stage.context.for_finish(), &RefObject::named("artifact"))
        .unwrap();
    assert!(outside.is_none());
}

#[tokio::test]
async fn test_unresolvable_output_fails_the_reader() {
    let h = Harness::new();
    let pe = h.start(plan(
        "missing",
        "reader",
        vec![node("reader", "ECHO", "SYNC", json!({ "resolve": ["nope"] }))],
    ));
    h.settle().await;

    let reader = h.node(&pe.uuid, "reader");
    assert_eq!(reader.status, Status::Failed);
    assert!(reader.failure_info.unwrap().message.contains("nope"));
    assert_eq!(h.execution(&pe.uuid).status, Status::Failed);
}

#[tokio::test]
async fn test_bad_step_parameters_error_the_node() {
    let h = Harness::new();
    let pe = h.start(plan(
        "config",
        "wait",
        vec![advised(
            node("wait", "ASYNC", "ASYNC", json!({ "correlation_ids": [] })),
            json!([{ "type": "RETRY", "parameters": { "retry_count": 3 } }]),
        )],
    ));
    h.settle().await;

    // Configuration problems are never retried
    assert_eq!(h.attempts(&pe.uuid, "wait").len(), 1);
    let wait = h.node(&pe.uuid, "wait");
    assert_eq!(wait.status, Status::Errored);
    assert_eq!(wait.advise.unwrap().advise, None);
    assert_eq!(h.execution(&pe.uuid).status, Status::Errored);
}

#[tokio::test]
async fn test_initial_wait_delays_the_strategy() {
    let h = Harness::new();
    let mut delayed = node("slow", "NOOP", "SYNC", json!(null));
    delayed["facilitator_obtainments"] = json!([{ "type": "SYNC", "parameters": { "initial_wait_ms": 30 } }]);
    let pe = h.start(plan("delayed", "slow", vec![delayed]));
    h.settle().await;

    let slow = h.node(&pe.uuid, "slow");
    assert_eq!(slow.status, Status::Succeeded);
    assert!(slow.end_ts.unwrap() >= slow.start_ts.unwrap() + 30);
}
