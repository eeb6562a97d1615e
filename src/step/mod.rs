//! Step Contract
//!
//! Steps hold the business logic; strategies invoke them. A step answers
//! with a [`StepOutcome`] that has to fit the mode the node was facilitated
//! with: an inline response, correlation ids to wait on, a task to dispatch,
//! children to spawn, or the next link of a chain. Steps must tolerate being
//! invoked again for the same link after a redelivery.

pub mod builtin;
pub mod registry;

pub use registry::StepRegistry;

use crate::context::{ExecutionContext, StepType, StrategyMetadata};
use crate::dispatch::TaskDescriptor;
use crate::error::StepError;
use crate::execution::{Conclusion, ExecutionMode, FailureInfo, FailureType, Status};
use crate::outputs::OutputResolver;
use crate::wait_notify::ResponseMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Final answer of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default)]
    pub failure: Option<FailureInfo>,
    /// Recorded as outcomes at the node's level
    #[serde(default)]
    pub outcomes: BTreeMap<String, Value>,
}

impl StepResponse {
    pub fn succeeded() -> Self {
        Self {
            status: Status::Succeeded,
            failure: None,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: Status::Skipped,
            ..Self::succeeded()
        }
    }

    pub fn failed(failure: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            failure: Some(failure),
            outcomes: BTreeMap::new(),
        }
    }

    pub fn with_outcome(mut self, name: impl Into<String>, value: Value) -> Self {
        self.outcomes.insert(name.into(), value);
        self
    }

    /// Default reading of wait-notify responses: any error response fails
    /// the step, otherwise object payloads become outcomes.
    pub fn from_responses(responses: &ResponseMap) -> Self {
        if let Some((correlation_id, error)) = responses.iter().find(|(_, r)| r.is_error) {
            let message = error
                .payload
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| error.payload.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("Task {} reported an error", correlation_id));
            return Self::failed(FailureInfo::step(message, vec![FailureType::Application]));
        }
        let mut response = Self::succeeded();
        for (correlation_id, data) in responses {
            match &data.payload {
                Value::Object(fields) => {
                    for (key, value) in fields {
                        response.outcomes.insert(key.clone(), value.clone());
                    }
                }
                Value::Null => {}
                other => {
                    response.outcomes.insert(correlation_id.clone(), other.clone());
                }
            }
        }
        response
    }
}

impl From<StepResponse> for Conclusion {
    fn from(response: StepResponse) -> Self {
        Conclusion {
            status: response.status,
            failure_info: response.failure,
            outcomes: response.outcomes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpawn {
    pub node_id: String,
    /// Set for strategy iterations (matrix, repeat)
    #[serde(default)]
    pub strategy: Option<StrategyMetadata>,
}

impl ChildSpawn {
    pub fn node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            strategy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Done inline
    Response(StepResponse),
    /// Wait for these ids to be notified by whoever the step contacted
    Async { correlation_ids: Vec<String> },
    /// Hand this task to the dispatcher and wait for its result
    Task(TaskDescriptor),
    Child { node_id: String },
    Children {
        children: Vec<ChildSpawn>,
        max_concurrency: Option<usize>,
    },
    TaskLink {
        descriptor: TaskDescriptor,
        pass_through: Value,
        chain_end: bool,
    },
    ChildLink {
        node_id: String,
        pass_through: Value,
        chain_end: bool,
    },
}

impl StepOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            StepOutcome::Response(_) => "response",
            StepOutcome::Async { .. } => "async",
            StepOutcome::Task(_) => "task",
            StepOutcome::Child { .. } => "child",
            StepOutcome::Children { .. } => "children",
            StepOutcome::TaskLink { .. } => "task_link",
            StepOutcome::ChildLink { .. } => "child_link",
        }
    }

    /// Whether a node facilitated as `mode` may answer with this outcome
    pub fn fits(&self, mode: ExecutionMode) -> bool {
        matches!(
            (mode, self),
            (ExecutionMode::Sync, StepOutcome::Response(_))
                | (ExecutionMode::Barrier, StepOutcome::Response(_))
                | (ExecutionMode::ResourceRestraint, StepOutcome::Response(_))
                | (ExecutionMode::Async, StepOutcome::Async { .. })
                | (ExecutionMode::Task, StepOutcome::Task(_))
                | (ExecutionMode::Child, StepOutcome::Child { .. })
                | (ExecutionMode::Children, StepOutcome::Children { .. })
                | (ExecutionMode::TaskChain, StepOutcome::TaskLink { .. })
                | (ExecutionMode::ChildChain, StepOutcome::ChildLink { .. })
        )
    }
}

/// Everything a step sees when invoked
#[derive(Clone, Copy)]
pub struct StepInvocation<'a> {
    pub node_execution_id: &'a str,
    pub context: &'a ExecutionContext,
    pub step_type: &'a StepType,
    pub parameters: &'a Value,
    pub mode: ExecutionMode,
    /// Facilitator data, or the previous chain link's pass-through
    pub pass_through: &'a Value,
    /// Responses of the previous chain link; empty on the first invocation
    pub responses: &'a ResponseMap,
    pub chain_index: usize,
    pub outputs: &'a OutputResolver,
}

#[async_trait]
pub trait Step: Send + Sync {
    async fn execute(&self, invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError>;

    /// Turn the responses of an async/task wait (or a finished task chain)
    /// into the step's final answer.
    async fn handle_response(
        &self,
        _invocation: &StepInvocation<'_>,
        responses: &ResponseMap,
    ) -> Result<StepResponse, StepError> {
        Ok(StepResponse::from_responses(responses))
    }
}
