//! The node execution record and what it carries.

use crate::adviser::Advise;
use crate::context::{ExecutionContext, StepType};
use crate::error::StepError;
use crate::execution::Status;
use crate::interrupt::InterruptType;
use crate::types::{now_millis, RuntimeId, SetupId};
use crate::wait_notify::ResponseMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// How the engine drives a node once facilitated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Child,
    Children,
    ChildChain,
    Task,
    TaskChain,
    Barrier,
    ResourceRestraint,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sync => "SYNC",
            ExecutionMode::Async => "ASYNC",
            ExecutionMode::Child => "CHILD",
            ExecutionMode::Children => "CHILDREN",
            ExecutionMode::ChildChain => "CHILD_CHAIN",
            ExecutionMode::Task => "TASK",
            ExecutionMode::TaskChain => "TASK_CHAIN",
            ExecutionMode::Barrier => "BARRIER",
            ExecutionMode::ResourceRestraint => "RESOURCE_RESTRAINT",
        }
    }

    /// Modes whose node spawns child node executions
    pub fn spawns_children(&self) -> bool {
        matches!(
            self,
            ExecutionMode::Child | ExecutionMode::Children | ExecutionMode::ChildChain
        )
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Unknown,
    Application,
    Timeout,
    Connectivity,
    Authentication,
    Authorization,
    Verification,
    DelegateProvisioning,
    PolicyEvaluation,
    ApprovalRejection,
    UserMarked,
}

/// Which layer a failure came from; decides retryability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Missing facilitator/adviser/step, malformed plan; never retried
    Configuration,
    /// Business failure reported by a step
    Step,
    /// Store/bus/dispatch trouble outside the step
    Infrastructure,
    /// Forced by an operator or an expiry
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
    pub class: ErrorClass,
    pub retryable: bool,
}

impl FailureInfo {
    pub fn step(message: impl Into<String>, failure_types: Vec<FailureType>) -> Self {
        Self {
            message: message.into(),
            failure_types,
            class: ErrorClass::Step,
            retryable: true,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failure_types: vec![FailureType::Unknown],
            class: ErrorClass::Configuration,
            retryable: false,
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failure_types: vec![FailureType::Connectivity],
            class: ErrorClass::Infrastructure,
            retryable: true,
        }
    }

    pub fn interrupt(message: impl Into<String>, failure_types: Vec<FailureType>) -> Self {
        Self {
            message: message.into(),
            failure_types,
            class: ErrorClass::Interrupt,
            retryable: true,
        }
    }

    pub fn has_any_type(&self, wanted: &[FailureType]) -> bool {
        wanted.is_empty() || self.failure_types.iter().any(|t| wanted.contains(t))
    }
}

impl From<StepError> for FailureInfo {
    fn from(err: StepError) -> Self {
        match err {
            StepError::Failed {
                message,
                failure_types,
            } => FailureInfo::step(message, failure_types),
            StepError::InvalidParameters(message) => FailureInfo {
                message,
                failure_types: vec![FailureType::Application],
                class: ErrorClass::Configuration,
                retryable: false,
            },
            StepError::Infrastructure(message) => FailureInfo::infrastructure(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRef {
    pub runtime_id: RuntimeId,
    pub node_id: SetupId,
}

/// What the strategy did for the node; appended, never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutableResponse {
    Sync,
    Async {
        correlation_ids: Vec<String>,
    },
    Task {
        task_id: String,
        correlation_id: String,
        task_type: String,
    },
    TaskChain {
        task_id: String,
        correlation_id: String,
        task_type: String,
        chain_end: bool,
        #[serde(default)]
        pass_through: Value,
    },
    Child {
        child: ChildRef,
    },
    Children {
        children: Vec<ChildRef>,
        #[serde(default)]
        max_concurrency: Option<usize>,
        /// Children released so far, in order
        #[serde(default)]
        started: usize,
    },
    ChildChain {
        child: ChildRef,
        chain_end: bool,
        #[serde(default)]
        pass_through: Value,
    },
    Barrier {
        barrier_id: String,
        correlation_id: String,
    },
    ResourceRestraint {
        resource_unit: String,
        instance_id: String,
        blocked: bool,
    },
}

impl ExecutableResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutableResponse::Sync => "sync",
            ExecutableResponse::Async { .. } => "async",
            ExecutableResponse::Task { .. } => "task",
            ExecutableResponse::TaskChain { .. } => "task_chain",
            ExecutableResponse::Child { .. } => "child",
            ExecutableResponse::Children { .. } => "children",
            ExecutableResponse::ChildChain { .. } => "child_chain",
            ExecutableResponse::Barrier { .. } => "barrier",
            ExecutableResponse::ResourceRestraint { .. } => "resource_restraint",
        }
    }
}

/// The advise applied to a terminal attempt, recorded once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviseRecord {
    /// `None` when no adviser applied and the branch simply ended
    pub advise: Option<Advise>,
    pub adviser: Option<String>,
    pub applied_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptEffect {
    pub interrupt_id: String,
    pub interrupt_type: InterruptType,
    pub applied_at: u64,
}

/// A final answer held back because the node was paused when it arrived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conclusion {
    pub status: Status,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcomes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub ts: u64,
    pub message: String,
}

/// One attempt at running a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub uuid: RuntimeId,
    pub plan_execution_id: String,
    pub node_id: SetupId,
    pub identifier: String,
    pub name: String,
    pub step_type: StepType,
    pub context: ExecutionContext,
    pub status: Status,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub parent_id: Option<RuntimeId>,
    #[serde(default)]
    pub previous_id: Option<RuntimeId>,
    #[serde(default)]
    pub next_id: Option<RuntimeId>,
    /// Correlation id this branch reports completion on
    #[serde(default)]
    pub notify_id: Option<String>,
    #[serde(default)]
    pub retry_ids: Vec<RuntimeId>,
    #[serde(default)]
    pub old_retry: bool,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub advise: Option<AdviseRecord>,
    #[serde(default)]
    pub status_before_pause: Option<Status>,
    #[serde(default)]
    pub status_before_intervention: Option<Status>,
    /// Wait-notify responses that arrived while paused
    #[serde(default)]
    pub deferred_responses: Option<ResponseMap>,
    #[serde(default)]
    pub deferred_conclusion: Option<Conclusion>,
    #[serde(default)]
    pub pass_through: Value,
    #[serde(default)]
    pub interrupt_history: Vec<InterruptEffect>,
    #[serde(default)]
    pub progress: Vec<ProgressEntry>,
    pub created_at: u64,
    #[serde(default)]
    pub start_ts: Option<u64>,
    #[serde(default)]
    pub end_ts: Option<u64>,
    pub last_updated_at: u64,
    #[serde(default)]
    pub version: u64,
}

impl NodeExecution {
    /// A fresh attempt in `Queued`; `context` must already carry the node's level.
    pub fn queued(
        uuid: RuntimeId,
        node_id: SetupId,
        identifier: impl Into<String>,
        name: impl Into<String>,
        step_type: StepType,
        context: ExecutionContext,
    ) -> Self {
        let now = now_millis();
        Self {
            uuid,
            plan_execution_id: context.plan_execution_id.clone(),
            node_id,
            identifier: identifier.into(),
            name: name.into(),
            step_type,
            context,
            status: Status::Queued,
            mode: None,
            parent_id: None,
            previous_id: None,
            next_id: None,
            notify_id: None,
            retry_ids: Vec::new(),
            old_retry: false,
            executable_responses: Vec::new(),
            failure_info: None,
            advise: None,
            status_before_pause: None,
            status_before_intervention: None,
            deferred_responses: None,
            deferred_conclusion: None,
            pass_through: Value::Null,
            interrupt_history: Vec::new(),
            progress: Vec::new(),
            created_at: now,
            start_ts: None,
            end_ts: None,
            last_updated_at: now,
            version: 0,
        }
    }

    pub fn with_parent(mut self, parent_id: Option<RuntimeId>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_notify_id(mut self, notify_id: Option<String>) -> Self {
        self.notify_id = notify_id;
        self
    }

    pub fn with_previous(mut self, previous_id: Option<RuntimeId>) -> Self {
        self.previous_id = previous_id;
        self
    }

    pub fn retry_index(&self) -> u32 {
        self.context.retry_index()
    }

    /// A leaf does its own work instead of spawning children
    pub fn is_leaf(&self) -> bool {
        !self.mode.map(|m| m.spawns_children()).unwrap_or(false)
    }

    pub fn last_executable_response(&self) -> Option<&ExecutableResponse> {
        self.executable_responses.last()
    }

    /// Status the node was broken with, looking through an intervention wait
    pub fn broken_status(&self) -> Option<Status> {
        match self.status {
            Status::InterventionWaiting => self.status_before_intervention,
            s if s.is_broken() => Some(s),
            _ => None,
        }
    }
}
