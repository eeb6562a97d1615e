//! Task Dispatch
//!
//! TASK and TASK_CHAIN nodes hand units of work to a [`TaskDispatcher`]. The
//! engine only learns the outcome through wait-notify: whoever runs the task
//! notifies the request's correlation id with the result.

pub mod queue;

pub use queue::{QueueStats, TaskQueue};

use crate::error::EngineError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use thiserror::Error;

/// Priority of a dispatched task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

/// What a step asks to be run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
}

impl TaskDescriptor {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A task bound to the node attempt that waits for it
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Id the result must be notified under
    pub correlation_id: String,
    pub node_execution_id: String,
    pub plan_execution_id: String,
    pub descriptor: TaskDescriptor,
    pub retry_count: usize,
    pub created_at: Instant,
}

impl TaskRequest {
    pub fn new(
        correlation_id: impl Into<String>,
        node_execution_id: impl Into<String>,
        plan_execution_id: impl Into<String>,
        descriptor: TaskDescriptor,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            node_execution_id: node_execution_id.into(),
            plan_execution_id: plan_execution_id.into(),
            descriptor,
            retry_count: 0,
            created_at: Instant::now(),
        }
    }
}

impl PartialEq for TaskRequest {
    fn eq(&self, other: &Self) -> bool {
        self.correlation_id == other.correlation_id
    }
}

impl Eq for TaskRequest {}

impl Ord for TaskRequest {
    /// Higher priority first, older first within a priority
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.descriptor.priority.cmp(&other.descriptor.priority) {
            std::cmp::Ordering::Equal => self.created_at.cmp(&other.created_at).reverse(),
            ordering => ordering,
        }
    }
}

impl PartialOrd for TaskRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Errors reported by a task runner
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task could not run: {0}")]
    Unavailable(String),

    #[error("Unknown task type: {0}")]
    UnknownType(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Unavailable(_))
    }
}

/// Hands a task to whatever executes it. Must not block on the task itself.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, request: TaskRequest) -> Result<(), EngineError>;
}

/// Executes one task and returns its result payload
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, request: &TaskRequest) -> Result<Value, TaskError>;
}

/// Runner that answers with the task payload. A payload carrying a `fail`
/// message fails the task instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoRunner;

#[async_trait]
impl TaskRunner for EchoRunner {
    async fn run(&self, request: &TaskRequest) -> Result<Value, TaskError> {
        if let Some(message) = request.descriptor.payload.get("fail").and_then(Value::as_str) {
            return Err(TaskError::Failed(message.to_string()));
        }
        Ok(request.descriptor.payload.clone())
    }
}

/// Dispatcher that only remembers what it was given; results are notified
/// by hand.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    requests: Mutex<Vec<TaskRequest>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<TaskRequest> {
        self.requests.lock().clone()
    }

    pub fn take(&self) -> Vec<TaskRequest> {
        std::mem::take(&mut *self.requests.lock())
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: TaskRequest) -> Result<(), EngineError> {
        self.requests.lock().push(request);
        Ok(())
    }
}
