//! Integration tests for barrier rendezvous between branches

use crate::integration::test_utils::*;
use cadence::barrier::BarrierState;
use cadence::execution::Status;
use serde_json::json;

fn rendezvous_plan(uuid: &str) -> cadence::plan::Plan {
    plan_with_barriers(
        uuid,
        "fork",
        vec![
            node("fork", "FORK", "CHILDREN", json!({ "children": ["left", "right"] })),
            node("left", "NOOP", "BARRIER", json!({ "barrier_ref": "sync" })),
            then(
                node("right", "ASYNC", "ASYNC", json!({ "correlation_ids": ["gate"] })),
                "right_b",
            ),
            node("right_b", "NOOP", "BARRIER", json!({ "barrier_ref": "sync" })),
        ],
        json!({ "sync": ["left", "right_b"] }),
    )
}

#[tokio::test]
async fn test_first_arrival_waits_for_the_rest() {
    let h = Harness::new();
    let pe = h.start(rendezvous_plan("barrier"));
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "left"), Status::AsyncWaiting);
    assert_eq!(h.status(&pe.uuid, "right"), Status::AsyncWaiting);
    assert!(h.attempts(&pe.uuid, "right_b").is_empty());

    let barrier = h
        .engine
        .barriers()
        .get(&pe.uuid, "sync")
        .unwrap()
        .expect("barrier recorded on first arrival");
    assert_eq!(barrier.state, BarrierState::Standing);
    assert_eq!(barrier.arrivals.len(), 1);
    assert!(barrier.arrivals.contains_key("left"));

    h.engine.notify("gate", json!({}), false).unwrap();
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "left"), Status::Succeeded);
    assert_eq!(h.status(&pe.uuid, "right_b"), Status::Succeeded);
    assert_eq!(h.status(&pe.uuid, "fork"), Status::Succeeded);
    assert_eq!(h.execution(&pe.uuid).status, Status::Succeeded);

    let barrier = h.engine.barriers().get(&pe.uuid, "sync").unwrap().unwrap();
    assert_eq!(barrier.state, BarrierState::Down);
    assert!(barrier.down_at.is_some());
}

#[tokio::test]
async fn test_undeclared_barrier_errors_the_node() {
    let h = Harness::new();
    let pe = h.start(plan(
        "no-barrier",
        "alone",
        vec![node("alone", "NOOP", "BARRIER", json!({ "barrier_ref": "missing" }))],
    ));
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "alone"), Status::Errored);
    assert_eq!(h.execution(&pe.uuid).status, Status::Errored);
}
