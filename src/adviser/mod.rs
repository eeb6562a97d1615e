//! Advisers
//!
//! An adviser decides what happens after a node reaches a terminal status:
//! move on to a sibling, retry, force success, wait for a human, or end the
//! plan. Advisers only return an [`Advise`]; the engine is the one that
//! applies it, exactly once per terminal transition.

pub mod builtin;
pub mod registry;

pub use builtin::{
    EndPlanAdviser, IgnoreFailureAdviser, InterventionWaitAdviser, ManualInterventionAdviser,
    NextStepAdviser, RetryAdviser,
};
pub use registry::AdviserRegistry;

use crate::error::EngineError;
use crate::execution::{FailureInfo, NodeExecution, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserType {
    NextStep,
    Retry,
    IgnoreFailure,
    InterventionWait,
    ManualIntervention,
    EndPlan,
}

impl AdviserType {
    pub const ALL: [AdviserType; 6] = [
        AdviserType::NextStep,
        AdviserType::Retry,
        AdviserType::IgnoreFailure,
        AdviserType::InterventionWait,
        AdviserType::ManualIntervention,
        AdviserType::EndPlan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdviserType::NextStep => "NEXT_STEP",
            AdviserType::Retry => "RETRY",
            AdviserType::IgnoreFailure => "IGNORE_FAILURE",
            AdviserType::InterventionWait => "INTERVENTION_WAIT",
            AdviserType::ManualIntervention => "MANUAL_INTERVENTION",
            AdviserType::EndPlan => "END_PLAN",
        }
    }
}

impl std::fmt::Display for AdviserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when retries run out or an intervention wait times out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairAction {
    /// End the plan as aborted
    #[default]
    Abort,
    /// End the plan with the node's status
    EndExecution,
    /// Mark the node succeeded; the branch ends there
    MarkAsSuccess,
    /// Mark the node succeeded and continue to the next node
    Ignore,
}

impl RepairAction {
    pub fn into_advise(self, next_node_id: Option<String>) -> Advise {
        match self {
            RepairAction::Abort => Advise::EndPlan { is_abort: true },
            RepairAction::EndExecution => Advise::EndPlan { is_abort: false },
            RepairAction::MarkAsSuccess => Advise::MarkSuccess { next_node_id: None },
            RepairAction::Ignore => Advise::MarkSuccess { next_node_id },
        }
    }
}

/// The decision an adviser returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Advise {
    /// Start the named sibling, or end the branch when `None`
    NextStep { next_node_id: Option<String> },
    /// New attempt of the same plan node after `wait_ms`
    Retry { wait_ms: u64 },
    /// Broken node becomes `Succeeded`, then behaves like `NextStep`
    MarkSuccess { next_node_id: Option<String> },
    /// Suspend for a manual decision; `repair_action` applies on timeout
    InterventionWait {
        timeout_ms: u64,
        repair_action: RepairAction,
        #[serde(default)]
        next_node_id: Option<String>,
    },
    EndPlan { is_abort: bool },
}

impl Advise {
    pub fn name(&self) -> &'static str {
        match self {
            Advise::NextStep { .. } => "NEXT_STEP",
            Advise::Retry { .. } => "RETRY",
            Advise::MarkSuccess { .. } => "MARK_SUCCESS",
            Advise::InterventionWait { .. } => "INTERVENTION_WAIT",
            Advise::EndPlan { .. } => "END_PLAN",
        }
    }
}

/// Everything an adviser may look at
#[derive(Debug, Clone, Copy)]
pub struct AdvisingEvent<'a> {
    pub node: &'a NodeExecution,
    /// Status the node held before it became terminal
    pub from_status: Option<Status>,
    pub to_status: Status,
    /// The obtainment's parameters
    pub parameters: &'a Value,
}

impl<'a> AdvisingEvent<'a> {
    pub fn failure_info(&self) -> Option<&'a FailureInfo> {
        self.node.failure_info.as_ref()
    }

    pub fn retry_index(&self) -> u32 {
        self.node.retry_index()
    }
}

pub trait Adviser: Send + Sync {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError>;

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<Advise, EngineError>;
}

/// Decode obtainment parameters; `null` means all defaults.
pub(crate) fn parameters<T>(adviser: AdviserType, raw: &Value) -> Result<T, EngineError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if raw.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(raw.clone()).map_err(|e| {
        EngineError::ConfigError(format!("Invalid {} adviser parameters: {}", adviser, e))
    })
}
