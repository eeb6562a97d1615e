//! Durable timers.
//!
//! Records are keyed by a zero-padded deadline so a prefix scan returns them
//! in firing order. `fire_due` claims each due timer by removing it; only the
//! caller whose removal succeeded gets it back.

use crate::error::EngineError;
use crate::store::{Collection, KeyIndex, Storage};
use crate::types::derive_id;
use serde::{Deserialize, Serialize};
use tracing::debug;

const TREE_TIMERS: &str = "timers";
const TREE_BY_NODE: &str = "timers_by_node";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerKind {
    /// Facilitated node waited out its initial delay
    InvokeStrategy,
    /// Queued retry attempt waited out its backoff
    StartNode,
    /// Intervention wait ran out; apply the repair action
    InterventionTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub uuid: String,
    pub kind: TimerKind,
    pub node_execution_id: String,
    pub plan_execution_id: String,
    pub deadline: u64,
}

impl TimerRecord {
    fn key(&self) -> String {
        format!("{:020}:{}", self.deadline, self.uuid)
    }
}

#[derive(Clone)]
pub struct TimerService {
    timers: Collection<TimerRecord>,
    by_node: KeyIndex,
}

impl TimerService {
    pub fn open(storage: &Storage) -> Result<Self, EngineError> {
        Ok(Self {
            timers: Collection::open(storage, TREE_TIMERS)?,
            by_node: KeyIndex::open(storage, TREE_BY_NODE)?,
        })
    }

    pub fn schedule(
        &self,
        kind: TimerKind,
        plan_execution_id: &str,
        node_execution_id: &str,
        deadline: u64,
    ) -> Result<TimerRecord, EngineError> {
        let record = TimerRecord {
            uuid: derive_id(&[node_execution_id, &format!("{:?}", kind)]),
            kind,
            node_execution_id: node_execution_id.to_string(),
            plan_execution_id: plan_execution_id.to_string(),
            deadline,
        };
        let key = record.key();
        self.timers.put(&key, &record)?;
        self.by_node.add(node_execution_id, &key)?;
        debug!(
            node_execution_id,
            kind = ?kind,
            deadline,
            "Timer scheduled"
        );
        Ok(record)
    }

    /// Claim every timer due at `now`, oldest first
    pub fn fire_due(&self, now: u64) -> Result<Vec<TimerRecord>, EngineError> {
        let mut fired = Vec::new();
        for (key, record) in self.timers.scan_prefix("")? {
            if record.deadline > now {
                break;
            }
            if self.timers.remove(&key)?.is_some() {
                self.by_node.remove(&record.node_execution_id, &key)?;
                fired.push(record);
            }
        }
        Ok(fired)
    }

    /// Drop pending timers of a node; returns how many were removed.
    pub fn cancel_for_node(&self, node_execution_id: &str) -> Result<usize, EngineError> {
        let mut cancelled = 0;
        for key in self.by_node.members(node_execution_id)? {
            if self.timers.remove(&key)?.is_some() {
                cancelled += 1;
            }
            self.by_node.remove(node_execution_id, &key)?;
        }
        Ok(cancelled)
    }

    pub fn pending_for_node(&self, node_execution_id: &str) -> Result<Vec<TimerRecord>, EngineError> {
        let mut out = Vec::new();
        for key in self.by_node.members(node_execution_id)? {
            if let Some(record) = self.timers.get(&key)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn next_deadline(&self) -> Result<Option<u64>, EngineError> {
        Ok(self
            .timers
            .scan_prefix("")?
            .into_iter()
            .next()
            .map(|(_, r)| r.deadline))
    }
}
