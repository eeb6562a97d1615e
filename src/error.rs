//! Error types for the Cadence orchestration engine.

use crate::execution::Status;
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {collection}/{key}")]
    NotFound { collection: String, key: String },

    #[error("Record already exists: {collection}/{key}")]
    AlreadyExists { collection: String, key: String },

    #[error("Conditional write on {collection}/{key} lost {attempts} times in a row")]
    Contention {
        collection: String,
        key: String,
        attempts: usize,
    },

    #[error("Corrupt record in {collection}: {reason}")]
    Corrupt { collection: String, reason: String },

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Engine-level errors.
///
/// Configuration errors are fatal for the node (or plan) they concern; step
/// failures never surface here, they are carried as `FailureInfo` on the
/// node execution instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Plan node not found: {plan_id}/{node_id}")]
    PlanNodeNotFound { plan_id: String, node_id: String },

    #[error("Plan execution not found: {0}")]
    PlanExecutionNotFound(String),

    #[error("Node execution not found: {0}")]
    NodeExecutionNotFound(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("No facilitator applies to node {0}")]
    NoFacilitator(String),

    #[error("Facilitator not registered: {0}")]
    FacilitatorNotRegistered(String),

    #[error("Adviser not registered: {0}")]
    AdviserNotRegistered(String),

    #[error("Step type not registered: {0}")]
    StepNotRegistered(String),

    #[error("Step for node {node} answered with {outcome} while facilitated as {mode}")]
    ModeMismatch {
        node: String,
        mode: String,
        outcome: String,
    },

    #[error("Invalid status transition for {node_execution_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        node_execution_id: String,
        from: Status,
        to: Status,
    },

    #[error("Output '{name}' already produced at level {runtime_id}")]
    OutputConflict { name: String, runtime_id: String },

    #[error("Output '{0}' could not be resolved from the current scope")]
    OutputNotFound(String),

    #[error("No enclosing level belongs to group '{0}'")]
    GroupNotFound(String),

    #[error("Interrupt rejected: {0}")]
    InterruptRejected(String),

    #[error("Interrupt not found: {0}")]
    InterruptNotFound(String),

    #[error("Resource not defined: {0}")]
    ResourceNotDefined(String),

    #[error("Correlation id '{correlation_id}' is still awaited by wait {wait_id}")]
    CorrelationInUse {
        correlation_id: String,
        wait_id: String,
    },

    #[error("Event bus error: {0}")]
    BusError(String),

    #[error("Task dispatch failed: {0}")]
    DispatchError(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::StorageError(StorageError::Corrupt {
            collection: "payload".to_string(),
            reason: err.to_string(),
        })
    }
}

/// Failure raised by step business logic.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("{message}")]
    Failed {
        message: String,
        failure_types: Vec<crate::execution::FailureType>,
    },

    #[error("Step rejected its parameters: {0}")]
    InvalidParameters(String),

    #[error("Step infrastructure error: {0}")]
    Infrastructure(String),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed {
            message: message.into(),
            failure_types: vec![crate::execution::FailureType::Application],
        }
    }
}
