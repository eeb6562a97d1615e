//! Integration tests for resource restraints across plan executions

use crate::integration::test_utils::*;
use cadence::config::{CadenceConfig, ResourceConfig};
use cadence::engine::PlanExecution;
use cadence::execution::Status;
use cadence::interrupt::{InterruptRequest, InterruptState, InterruptType};
use cadence::restraint::RestraintState;
use serde_json::{json, Value};

/// `lock` takes the resource for the whole plan, `hold` keeps the plan open
/// until `done` is notified.
fn holding_plan(uuid: &str, resource: &str, lock_params: Value, done: &str) -> cadence::plan::Plan {
    let mut params = lock_params;
    params["resource_unit"] = json!(resource);
    params["holding_scope"] = json!("plan");
    plan(
        uuid,
        "lock",
        vec![
            then(node("lock", "NOOP", "RESOURCE_RESTRAINT", params), "hold"),
            node("hold", "ASYNC", "ASYNC", json!({ "correlation_ids": [done] })),
        ],
    )
}

fn exclusive(uuid: &str, done: &str) -> cadence::plan::Plan {
    holding_plan(uuid, "env-prod", json!({}), done)
}

#[tokio::test]
async fn test_exclusive_holders_are_served_in_arrival_order() {
    let h = Harness::new();
    let a = h.start(exclusive("deploy-a", "done-a"));
    h.settle().await;
    let b = h.start(exclusive("deploy-b", "done-b"));
    h.settle().await;
    let c = h.start(exclusive("deploy-c", "done-c"));
    h.settle().await;

    assert_eq!(h.status(&a.uuid, "hold"), Status::AsyncWaiting);
    assert_eq!(h.status(&b.uuid, "lock"), Status::ResourceWaiting);
    assert_eq!(h.status(&c.uuid, "lock"), Status::ResourceWaiting);

    let holders = h.engine.restraints().holders("env-prod").unwrap();
    let entities: Vec<&str> = holders.iter().map(|i| i.release_entity_id.as_str()).collect();
    assert_eq!(entities, vec![a.uuid.as_str(), b.uuid.as_str(), c.uuid.as_str()]);
    assert_eq!(holders[0].state, RestraintState::Active);
    assert!(holders[0].order < holders[1].order && holders[1].order < holders[2].order);

    // A's plan ends, which hands the resource to B and only B
    h.engine.notify("done-a", json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.execution(&a.uuid).status, Status::Succeeded);
    assert_eq!(h.status(&b.uuid, "lock"), Status::Succeeded);
    assert_eq!(h.status(&b.uuid, "hold"), Status::AsyncWaiting);
    assert_eq!(h.status(&c.uuid, "lock"), Status::ResourceWaiting);

    h.engine.notify("done-b", json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.status(&c.uuid, "lock"), Status::Succeeded);

    h.engine.notify("done-c", json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.execution(&c.uuid).status, Status::Succeeded);
    assert!(h.engine.restraints().holders("env-prod").unwrap().is_empty());
}

#[tokio::test]
async fn test_aborting_a_blocked_waiter_withdraws_its_request() {
    let h = Harness::new();
    let a = h.start(exclusive("abort-a", "done-a"));
    h.settle().await;
    let b = h.start(exclusive("abort-b", "done-b"));
    h.settle().await;

    let lock = h.node(&b.uuid, "lock");
    assert_eq!(lock.status, Status::ResourceWaiting);

    let interrupt = h
        .interrupt(InterruptRequest::new(InterruptType::Abort, &b.uuid).for_node(&lock.uuid))
        .await;
    assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);
    assert_eq!(h.status(&b.uuid, "lock"), Status::Aborted);
    assert_eq!(h.execution(&b.uuid).status, Status::Aborted);

    let holders = h.engine.restraints().holders("env-prod").unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].release_entity_id, a.uuid);

    // Nothing is promoted on behalf of the aborted plan
    h.engine.notify("done-a", json!({}), false).unwrap();
    h.settle().await;
    assert!(h.engine.restraints().holders("env-prod").unwrap().is_empty());
    assert!(h.attempts(&b.uuid, "hold").is_empty());
}

#[tokio::test]
async fn test_aborting_the_holder_promotes_the_next_waiter() {
    let h = Harness::new();
    let a = h.start(exclusive("holder-a", "done-a"));
    h.settle().await;
    let b = h.start(exclusive("holder-b", "done-b"));
    h.settle().await;
    assert_eq!(h.status(&b.uuid, "lock"), Status::ResourceWaiting);

    let interrupt = h.interrupt(InterruptRequest::new(InterruptType::AbortAll, &a.uuid)).await;
    assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);
    h.settle().await;

    assert_eq!(h.execution(&a.uuid).status, Status::Aborted);
    assert_eq!(h.status(&b.uuid, "lock"), Status::Succeeded);
    assert_eq!(h.status(&b.uuid, "hold"), Status::AsyncWaiting);

    let holders = h.engine.restraints().holders("env-prod").unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].release_entity_id, b.uuid);
    assert_eq!(holders[0].state, RestraintState::Active);
}

#[tokio::test]
async fn test_bounded_permits_admit_up_to_capacity() {
    let mut config = CadenceConfig::default();
    config
        .restraints
        .insert("runners".to_string(), ResourceConfig { capacity: 2 });
    let h = Harness::with(config, |b| b);

    let bounded = |uuid: &str, done: &str| holding_plan(uuid, "runners", json!({ "permits": 1 }), done);
    let started: Vec<PlanExecution> = ["one", "two", "three"]
        .iter()
        .map(|name| h.start(bounded(&format!("ci-{}", name), &format!("done-{}", name))))
        .collect();
    h.settle().await;

    let statuses: Vec<Status> = started.iter().map(|pe| h.status(&pe.uuid, "lock")).collect();
    assert_eq!(
        statuses.iter().filter(|s| **s == Status::Succeeded).count(),
        2
    );
    assert_eq!(
        statuses.iter().filter(|s| **s == Status::ResourceWaiting).count(),
        1
    );
    let ledger = h.engine.restraints().ledger("runners").unwrap().unwrap();
    assert_eq!(ledger.capacity, 2);
    assert_eq!(ledger.active_permits(), 2);

    // Free one slot: the waiting plan gets it
    let (done, waiting) = {
        let first_active = started
            .iter()
            .zip(["one", "two", "three"])
            .find(|(pe, _)| h.status(&pe.uuid, "lock") == Status::Succeeded)
            .map(|(_, name)| format!("done-{}", name))
            .unwrap();
        let waiting = started
            .iter()
            .find(|pe| h.status(&pe.uuid, "lock") == Status::ResourceWaiting)
            .unwrap()
            .uuid
            .clone();
        (first_active, waiting)
    };
    h.engine.notify(&done, json!({}), false).unwrap();
    h.settle().await;
    assert_eq!(h.status(&waiting, "lock"), Status::Succeeded);
    assert_eq!(
        h.engine.restraints().ledger("runners").unwrap().unwrap().active_permits(),
        2
    );
}

#[tokio::test]
async fn test_request_larger_than_capacity_errors_the_node() {
    let h = Harness::new();
    let pe = h.start(holding_plan("too-big", "single", json!({ "permits": 3 }), "never"));
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "lock"), Status::Errored);
    assert_eq!(h.execution(&pe.uuid).status, Status::Errored);
}

#[tokio::test]
async fn test_node_scoped_hold_ends_with_the_node() {
    let h = Harness::new();
    let pe = h.start(plan(
        "node-scope",
        "lock",
        vec![
            then(
                node("lock", "NOOP", "RESOURCE_RESTRAINT", json!({ "resource_unit": "db" })),
                "hold",
            ),
            node("hold", "ASYNC", "ASYNC", json!({ "correlation_ids": ["later"] })),
        ],
    ));
    h.settle().await;

    assert_eq!(h.status(&pe.uuid, "hold"), Status::AsyncWaiting);
    assert!(h.engine.restraints().holders("db").unwrap().is_empty());
}
