//! Barrier rendezvous.
//!
//! A plan declares barriers as sets of plan node ids. Each participant
//! arrives with the correlation id it waits on; the arrival that completes the
//! set takes the barrier down and every participant is notified.

use crate::error::EngineError;
use crate::store::{Collection, Storage, Update};
use crate::types::{derive_id, now_millis};
use crate::wait_notify::WaitNotifyService;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

const TREE_BARRIERS: &str = "barriers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarrierState {
    Standing,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arrival {
    pub node_execution_id: String,
    pub correlation_id: String,
    pub arrived_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierInstance {
    pub plan_execution_id: String,
    pub barrier_id: String,
    /// Plan node ids that must arrive
    pub participants: Vec<String>,
    pub arrivals: BTreeMap<String, Arrival>,
    pub state: BarrierState,
    #[serde(default)]
    pub down_at: Option<u64>,
}

impl BarrierInstance {
    fn complete(&self) -> bool {
        self.participants
            .iter()
            .all(|p| self.arrivals.contains_key(p))
    }
}

#[derive(Clone)]
pub struct BarrierService {
    barriers: Collection<BarrierInstance>,
    wait_notify: WaitNotifyService,
}

impl BarrierService {
    pub fn open(storage: &Storage, wait_notify: WaitNotifyService) -> Result<Self, EngineError> {
        Ok(Self {
            barriers: Collection::open(storage, TREE_BARRIERS)?,
            wait_notify,
        })
    }

    /// Correlation id a participant waits on
    pub fn correlation_id(
        plan_execution_id: &str,
        barrier_id: &str,
        node_execution_id: &str,
    ) -> String {
        derive_id(&["barrier", plan_execution_id, barrier_id, node_execution_id])
    }

    /// Record an arrival. Returns the barrier as stored afterwards; if this
    /// arrival took it down, every participant has been notified.
    pub fn arrive(
        &self,
        plan_execution_id: &str,
        barrier_id: &str,
        participants: &[String],
        node_id: &str,
        node_execution_id: &str,
    ) -> Result<BarrierInstance, EngineError> {
        if !participants.iter().any(|p| p == node_id) {
            return Err(EngineError::InvalidPlan(format!(
                "Node '{}' is not a participant of barrier '{}'",
                node_id, barrier_id
            )));
        }
        let key = format!("{}:{}", plan_execution_id, barrier_id);
        let correlation_id = Self::correlation_id(plan_execution_id, barrier_id, node_execution_id);
        let mut took_down = false;
        let outcome = self.barriers.upsert(
            &key,
            || BarrierInstance {
                plan_execution_id: plan_execution_id.to_string(),
                barrier_id: barrier_id.to_string(),
                participants: participants.to_vec(),
                arrivals: BTreeMap::new(),
                state: BarrierState::Standing,
                down_at: None,
            },
            |barrier| {
                took_down = false;
                if barrier.state == BarrierState::Down {
                    return false;
                }
                // A retried participant replaces its earlier arrival
                let same = barrier
                    .arrivals
                    .get(node_id)
                    .map(|a| a.node_execution_id == node_execution_id)
                    .unwrap_or(false);
                if same {
                    return false;
                }
                barrier.arrivals.insert(
                    node_id.to_string(),
                    Arrival {
                        node_execution_id: node_execution_id.to_string(),
                        correlation_id: correlation_id.clone(),
                        arrived_at: now_millis(),
                    },
                );
                if barrier.complete() {
                    barrier.state = BarrierState::Down;
                    barrier.down_at = Some(now_millis());
                    took_down = true;
                }
                true
            },
        )?;
        let barrier = match outcome {
            Update::Applied(b) | Update::Unchanged(b) => b,
            Update::Missing => {
                return Err(EngineError::InvalidPlan(format!("Barrier '{}' vanished", key)))
            }
        };
        debug!(
            plan_execution_id,
            barrier_id,
            node_id,
            arrived = barrier.arrivals.len(),
            expected = barrier.participants.len(),
            "Barrier arrival"
        );

        if took_down {
            info!(plan_execution_id, barrier_id, "Barrier down");
            for arrival in barrier.arrivals.values() {
                self.wait_notify.notify(
                    &arrival.correlation_id,
                    json!({ "barrier_id": barrier_id, "state": "DOWN" }),
                )?;
            }
        }
        Ok(barrier)
    }

    pub fn get(
        &self,
        plan_execution_id: &str,
        barrier_id: &str,
    ) -> Result<Option<BarrierInstance>, EngineError> {
        Ok(self
            .barriers
            .get(&format!("{}:{}", plan_execution_id, barrier_id))?)
    }
}
