//! Property-based tests for the restraint gate's fairness guarantees

use cadence::bus::InMemoryBus;
use cadence::config::WaitNotifyConfig;
use cadence::restraint::{
    AcquireMode, AcquireRequest, HoldingScope, RestraintGate, RestraintInstance, RestraintState,
};
use cadence::store::Storage;
use cadence::wait_notify::WaitNotifyService;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

const RESOURCE: &str = "pool";

#[derive(Debug, Clone)]
enum Op {
    /// Bounded acquire of this many permits
    Acquire(u32),
    /// Release the n-th live holder (modulo the holder count)
    Release(usize),
}

fn op(capacity: u32) -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1..=capacity).prop_map(Op::Acquire),
        2 => any::<usize>().prop_map(Op::Release),
    ]
}

fn gate(capacity: u32) -> RestraintGate {
    let storage = Storage::in_memory();
    let wait_notify = WaitNotifyService::open(
        &storage,
        Arc::new(InMemoryBus::new(5)),
        WaitNotifyConfig::default(),
    )
    .unwrap();
    let capacities: HashMap<String, u32> = [(RESOURCE.to_string(), capacity)].into_iter().collect();
    RestraintGate::open(&storage, capacities, wait_notify).unwrap()
}

fn weight(holder: &RestraintInstance) -> u32 {
    holder.permits
}

/// Apply `ops` and check the ledger after each one.
fn run(capacity: u32, ops: &[Op]) -> Result<(), TestCaseError> {
    let gate = gate(capacity);
    let mut next_id = 0;
    let mut promotions: Vec<u64> = Vec::new();

    for op in ops {
        match op {
            Op::Acquire(permits) => {
                next_id += 1;
                let instance = gate
                    .acquire(&AcquireRequest {
                        instance_id: format!("r-{}", next_id),
                        resource_unit: RESOURCE.to_string(),
                        release_entity_id: format!("node-{}", next_id),
                        scope: HoldingScope::Node,
                        mode: AcquireMode::Bounded { permits: *permits },
                    })
                    .unwrap();
                if instance.state == RestraintState::Active {
                    promotions.push(instance.order);
                }
            }
            Op::Release(n) => {
                let holders = gate.holders(RESOURCE).unwrap();
                if holders.is_empty() {
                    continue;
                }
                let target = &holders[n % holders.len()];
                for promoted in gate.release(RESOURCE, &target.uuid).unwrap() {
                    promotions.push(promoted.order);
                }
            }
        }

        let holders = gate.holders(RESOURCE).unwrap();
        let active: u32 = holders
            .iter()
            .filter(|h| h.state == RestraintState::Active)
            .map(weight)
            .sum();
        prop_assert!(active <= capacity, "{} permits active of {}", active, capacity);

        // Holders stay in sequence order and the blocked ones form a suffix
        prop_assert!(holders.windows(2).all(|w| w[0].order < w[1].order));
        if let Some(first_blocked) = holders.iter().position(|h| h.state == RestraintState::Blocked) {
            prop_assert!(holders[first_blocked..]
                .iter()
                .all(|h| h.state == RestraintState::Blocked));
            // Nobody is left waiting who would fit
            prop_assert!(active + weight(&holders[first_blocked]) > capacity);
        }
    }

    // Activation never overtakes an earlier request
    prop_assert!(promotions.windows(2).all(|w| w[0] < w[1]));
    Ok(())
}

/// Test that the gate never admits more permits than its capacity and
/// serves requests strictly in arrival order
#[test]
fn test_restraint_gate_fifo_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(1u32..=4).prop_flat_map(|capacity| {
                (Just(capacity), prop::collection::vec(op(capacity), 1..40))
            }),
            |(capacity, ops)| run(capacity, &ops),
        )
        .unwrap();
}

/// Test that releasing every holder always drains the ledger
#[test]
fn test_restraint_gate_drains_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&prop::collection::vec(1u32..=3, 1..20), |requests| {
            let gate = gate(3);
            for (i, permits) in requests.iter().enumerate() {
                gate.acquire(&AcquireRequest {
                    instance_id: format!("r-{}", i),
                    resource_unit: RESOURCE.to_string(),
                    release_entity_id: "plan-1".to_string(),
                    scope: HoldingScope::Plan,
                    mode: AcquireMode::Bounded { permits: *permits },
                })
                .unwrap();
            }

            let released = gate.release_for_entity("plan-1").unwrap();
            prop_assert_eq!(released, requests.len());
            prop_assert!(gate.holders(RESOURCE).unwrap().is_empty());
            Ok(())
        })
        .unwrap();
}
