//! Interrupts
//!
//! Externally raised control signals. Registration persists the interrupt as
//! `Registered` and publishes it on the interrupts topic, partitioned by plan
//! execution, so whichever worker picks it up can apply it. Processing is
//! claimed with a compare-and-swap (`Registered -> Processing`) and always
//! ends in a recorded outcome; unsupported combinations are recorded as
//! processed unsuccessfully with a reason.

use crate::bus::{publish_json, EventBus, TOPIC_INTERRUPTS};
use crate::error::EngineError;
use crate::store::{Collection, KeyIndex, Storage};
use crate::types::{generate_uuid, now_millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

const TREE_INTERRUPTS: &str = "interrupts";
const TREE_BY_PLAN: &str = "interrupts_by_plan";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    Abort,
    AbortAll,
    Pause,
    Resume,
    Retry,
    ExpireAll,
    CustomFailure,
    MarkSuccess,
    MarkFailed,
}

impl InterruptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptType::Abort => "ABORT",
            InterruptType::AbortAll => "ABORT_ALL",
            InterruptType::Pause => "PAUSE",
            InterruptType::Resume => "RESUME",
            InterruptType::Retry => "RETRY",
            InterruptType::ExpireAll => "EXPIRE_ALL",
            InterruptType::CustomFailure => "CUSTOM_FAILURE",
            InterruptType::MarkSuccess => "MARK_SUCCESS",
            InterruptType::MarkFailed => "MARK_FAILED",
        }
    }

    /// Needs a target node execution
    pub fn requires_node(&self) -> bool {
        matches!(
            self,
            InterruptType::Abort
                | InterruptType::Retry
                | InterruptType::CustomFailure
                | InterruptType::MarkSuccess
                | InterruptType::MarkFailed
        )
    }

    /// Applies to the whole plan execution only
    pub fn plan_wide(&self) -> bool {
        matches!(self, InterruptType::AbortAll | InterruptType::ExpireAll)
    }
}

impl std::fmt::Display for InterruptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InterruptType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        serde_json::from_value(Value::String(normalized))
            .map_err(|_| EngineError::InterruptRejected(format!("Unknown interrupt type '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    ProcessedSuccessfully,
    ProcessedUnsuccessfully { reason: String },
}

impl InterruptState {
    pub fn is_processed(&self) -> bool {
        matches!(
            self,
            InterruptState::ProcessedSuccessfully | InterruptState::ProcessedUnsuccessfully { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub uuid: String,
    pub interrupt_type: InterruptType,
    pub plan_execution_id: String,
    /// Target node; `None` targets the plan execution
    #[serde(default)]
    pub node_execution_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub issued_by: Option<String>,
    pub state: InterruptState,
    pub created_at: u64,
    #[serde(default)]
    pub processed_at: Option<u64>,
}

/// What an external actor supplies
#[derive(Debug, Clone, Default)]
pub struct InterruptRequest {
    pub interrupt_type: Option<InterruptType>,
    pub plan_execution_id: String,
    pub node_execution_id: Option<String>,
    pub metadata: Value,
    pub reason: Option<String>,
    pub issued_by: Option<String>,
}

impl InterruptRequest {
    pub fn new(interrupt_type: InterruptType, plan_execution_id: impl Into<String>) -> Self {
        Self {
            interrupt_type: Some(interrupt_type),
            plan_execution_id: plan_execution_id.into(),
            ..Self::default()
        }
    }

    pub fn for_node(mut self, node_execution_id: impl Into<String>) -> Self {
        self.node_execution_id = Some(node_execution_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn issued_by(mut self, who: impl Into<String>) -> Self {
        self.issued_by = Some(who.into());
        self
    }
}

/// Published on the interrupts topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptEvent {
    pub interrupt_id: String,
}

#[derive(Clone)]
pub struct InterruptStore {
    records: Collection<Interrupt>,
    by_plan: KeyIndex,
}

impl InterruptStore {
    pub fn open(storage: &Storage) -> Result<Self, EngineError> {
        Ok(Self {
            records: Collection::open(storage, TREE_INTERRUPTS)?,
            by_plan: KeyIndex::open(storage, TREE_BY_PLAN)?,
        })
    }

    pub fn save_new(&self, interrupt: &Interrupt) -> Result<(), EngineError> {
        if !self.records.insert_new(&interrupt.uuid, interrupt)? {
            return Err(EngineError::InterruptRejected(format!(
                "Interrupt {} already exists",
                interrupt.uuid
            )));
        }
        self.by_plan
            .add(&interrupt.plan_execution_id, &interrupt.uuid)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Interrupt, EngineError> {
        self.records
            .get(id)?
            .ok_or_else(|| EngineError::InterruptNotFound(id.to_string()))
    }

    /// `Registered -> Processing`; `None` when someone else already claimed it.
    pub fn claim(&self, id: &str) -> Result<Option<Interrupt>, EngineError> {
        let outcome = self.records.update(id, |i| {
            if i.state != InterruptState::Registered {
                return false;
            }
            i.state = InterruptState::Processing;
            true
        })?;
        Ok(outcome.applied())
    }

    pub fn complete(&self, id: &str, result: Result<(), String>) -> Result<Interrupt, EngineError> {
        let state = match result {
            Ok(()) => InterruptState::ProcessedSuccessfully,
            Err(reason) => InterruptState::ProcessedUnsuccessfully { reason },
        };
        let outcome = self.records.update(id, |i| {
            if i.state != InterruptState::Processing {
                return false;
            }
            i.state = state.clone();
            i.processed_at = Some(now_millis());
            true
        })?;
        match outcome.applied() {
            Some(interrupt) => Ok(interrupt),
            None => self.get(id),
        }
    }

    /// Interrupts of a plan execution, oldest first
    pub fn for_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>, EngineError> {
        let mut out = Vec::new();
        for id in self.by_plan.members(plan_execution_id)? {
            if let Some(interrupt) = self.records.get(&id)? {
                out.push(interrupt);
            }
        }
        out.sort_by_key(|i| i.created_at);
        Ok(out)
    }
}

/// Validates, persists and publishes interrupts.
#[derive(Clone)]
pub struct InterruptManager {
    store: InterruptStore,
    bus: Arc<dyn EventBus>,
}

impl InterruptManager {
    pub fn new(store: InterruptStore, bus: Arc<dyn EventBus>) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &InterruptStore {
        &self.store
    }

    pub fn register(&self, request: InterruptRequest) -> Result<Interrupt, EngineError> {
        let interrupt_type = request
            .interrupt_type
            .ok_or_else(|| EngineError::InterruptRejected("Interrupt type is required".to_string()))?;
        if request.plan_execution_id.is_empty() {
            return Err(EngineError::InterruptRejected(
                "Plan execution id is required".to_string(),
            ));
        }
        if interrupt_type.requires_node() && request.node_execution_id.is_none() {
            return Err(EngineError::InterruptRejected(format!(
                "{} needs a target node execution",
                interrupt_type
            )));
        }
        if interrupt_type.plan_wide() && request.node_execution_id.is_some() {
            return Err(EngineError::InterruptRejected(format!(
                "{} applies to the whole plan execution",
                interrupt_type
            )));
        }

        let interrupt = Interrupt {
            uuid: generate_uuid(),
            interrupt_type,
            plan_execution_id: request.plan_execution_id,
            node_execution_id: request.node_execution_id,
            metadata: request.metadata,
            reason: request.reason,
            issued_by: request.issued_by,
            state: InterruptState::Registered,
            created_at: now_millis(),
            processed_at: None,
        };
        self.store.save_new(&interrupt)?;
        let event = InterruptEvent {
            interrupt_id: interrupt.uuid.clone(),
        };
        if let Err(err) = publish_json(
            self.bus.as_ref(),
            TOPIC_INTERRUPTS,
            &interrupt.plan_execution_id,
            &event,
        ) {
            warn!(
                interrupt_id = %interrupt.uuid,
                error = %err,
                "Interrupt persisted but not published"
            );
            return Err(err);
        }
        info!(
            interrupt_id = %interrupt.uuid,
            interrupt_type = %interrupt.interrupt_type,
            plan_execution_id = %interrupt.plan_execution_id,
            node_execution_id = ?interrupt.node_execution_id,
            "Interrupt registered"
        );
        Ok(interrupt)
    }
}
