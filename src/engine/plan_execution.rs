//! Plan execution record and store.

use crate::error::{EngineError, StorageError};
use crate::execution::Status;
use crate::store::{Collection, Storage, Update};
use crate::types::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

const TREE_PLAN_EXECUTIONS: &str = "plan_executions";

/// One run of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub uuid: String,
    pub plan_id: String,
    pub status: Status,
    /// Plan-wide pause; nodes started meanwhile start paused
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    pub start_ts: u64,
    #[serde(default)]
    pub end_ts: Option<u64>,
}

impl PlanExecution {
    pub fn new(uuid: String, plan_id: String, setup_abstractions: BTreeMap<String, String>) -> Self {
        Self {
            uuid,
            plan_id,
            status: Status::Running,
            paused: false,
            setup_abstractions,
            start_ts: now_millis(),
            end_ts: None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

#[derive(Clone)]
pub struct PlanExecutionStore {
    records: Collection<PlanExecution>,
}

impl PlanExecutionStore {
    pub fn open(storage: &Storage) -> Result<Self, StorageError> {
        Ok(Self {
            records: Collection::open(storage, TREE_PLAN_EXECUTIONS)?,
        })
    }

    pub fn create(&self, record: &PlanExecution) -> Result<(), StorageError> {
        if !self.records.insert_new(&record.uuid, record)? {
            return Err(StorageError::AlreadyExists {
                collection: TREE_PLAN_EXECUTIONS.to_string(),
                key: record.uuid.clone(),
            });
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<PlanExecution>, StorageError> {
        self.records.get(id)
    }

    pub fn require(&self, id: &str) -> Result<PlanExecution, EngineError> {
        self.records
            .get(id)?
            .ok_or_else(|| EngineError::PlanExecutionNotFound(id.to_string()))
    }

    /// Flip the plan-wide pause flag. Returns false if the plan already
    /// ended or the flag already had that value.
    pub fn set_paused(&self, id: &str, paused: bool) -> Result<bool, StorageError> {
        let outcome = self.records.update(id, |pe| {
            if pe.is_final() || pe.paused == paused {
                return false;
            }
            pe.paused = paused;
            true
        })?;
        debug!(plan_execution_id = id, paused, applied = outcome.is_applied(), "Plan pause flag");
        Ok(outcome.is_applied())
    }

    /// Move a running plan execution to its final status, once.
    pub fn conclude(&self, id: &str, status: Status) -> Result<Option<PlanExecution>, StorageError> {
        let outcome = self.records.update(id, |pe| {
            if pe.is_final() {
                return false;
            }
            pe.status = status;
            pe.paused = false;
            pe.end_ts = Some(now_millis());
            true
        })?;
        Ok(match outcome {
            Update::Applied(pe) => {
                info!(plan_execution_id = id, status = %status, "Plan execution concluded");
                Some(pe)
            }
            _ => None,
        })
    }

    pub fn list(&self) -> Result<Vec<PlanExecution>, StorageError> {
        let mut all = self.records.values_with_prefix("")?;
        all.sort_by_key(|pe| pe.start_ts);
        Ok(all)
    }
}
