//! Built-in steps.
//!
//! Small, parameter-driven steps that cover every outcome kind. Plans loaded
//! by the CLI and the integration tests are built from these.

use crate::context::{MatrixMetadata, StrategyMetadata};
use crate::dispatch::TaskDescriptor;
use crate::error::{EngineError, StepError};
use crate::execution::FailureType;
use crate::outputs::RefObject;
use crate::step::{ChildSpawn, Step, StepInvocation, StepOutcome, StepResponse};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub const NOOP: &str = "NOOP";
pub const ECHO: &str = "ECHO";
pub const FAIL: &str = "FAIL";
pub const TASK: &str = "TASK";
pub const ASYNC: &str = "ASYNC";
pub const SECTION: &str = "SECTION";
pub const FORK: &str = "FORK";
pub const STRATEGY: &str = "STRATEGY";
pub const TASK_CHAIN: &str = "TASK_CHAIN";
pub const CHILD_CHAIN: &str = "CHILD_CHAIN";

fn params<T: DeserializeOwned + Default>(parameters: &Value) -> Result<T, StepError> {
    if parameters.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(parameters.clone())
        .map_err(|e| StepError::InvalidParameters(e.to_string()))
}

/// Succeeds inline. Also the usual step behind BARRIER and RESOURCE_RESTRAINT
/// nodes, whose work is the wait itself.
pub struct NoopStep;

#[async_trait]
impl Step for NoopStep {
    async fn execute(&self, _invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        Ok(StepOutcome::Response(StepResponse::succeeded()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct EchoParams {
    /// Published as sweeping outputs for descendants
    #[serde(default)]
    outputs: Map<String, Value>,
    /// Scope group the outputs are written to
    #[serde(default)]
    group: Option<String>,
    /// Output names resolved from enclosing levels into outcomes
    #[serde(default)]
    resolve: Vec<String>,
    #[serde(default)]
    outcomes: Map<String, Value>,
}

/// Publishes and reads sweeping outputs.
pub struct EchoStep;

#[async_trait]
impl Step for EchoStep {
    async fn execute(&self, invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let params: EchoParams = params(invocation.parameters)?;
        for (name, value) in &params.outputs {
            match invocation.outputs.consume(
                invocation.context,
                name,
                value.clone(),
                params.group.as_deref(),
            ) {
                Ok(_) => {}
                // Written by an earlier delivery of this invocation
                Err(EngineError::OutputConflict { .. }) => {
                    debug!(name = %name, "Output already present");
                }
                Err(EngineError::GroupNotFound(group)) => {
                    return Err(StepError::InvalidParameters(format!(
                        "No enclosing level in group '{}'",
                        group
                    )))
                }
                Err(e) => return Err(StepError::Infrastructure(e.to_string())),
            }
        }

        let mut response = StepResponse::succeeded();
        for (name, value) in params.outcomes {
            response.outcomes.insert(name, value);
        }
        for name in &params.resolve {
            let value = invocation
                .outputs
                .resolve_optional(invocation.context, &RefObject::named(name.as_str()))
                .map_err(|e| StepError::Infrastructure(e.to_string()))?
                .ok_or_else(|| StepError::Failed {
                    message: format!("Output '{}' is not visible from this node", name),
                    failure_types: vec![FailureType::Application],
                })?;
            response.outcomes.insert(name.clone(), value);
        }
        Ok(StepOutcome::Response(response))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FailParams {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    failure_types: Vec<FailureType>,
    /// Attempts (by retry index) that fail; later attempts succeed
    #[serde(default)]
    fail_attempts: Option<u32>,
}

/// Fails with the configured failure types.
pub struct FailStep;

#[async_trait]
impl Step for FailStep {
    async fn execute(&self, invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let params: FailParams = params(invocation.parameters)?;
        if let Some(attempts) = params.fail_attempts {
            if invocation.context.retry_index() >= attempts {
                return Ok(StepOutcome::Response(StepResponse::succeeded()));
            }
        }
        let failure_types = if params.failure_types.is_empty() {
            vec![FailureType::Application]
        } else {
            params.failure_types
        };
        Err(StepError::Failed {
            message: params.message.unwrap_or_else(|| "Step failed".to_string()),
            failure_types,
        })
    }
}

/// Dispatches `task` (a task descriptor) and reads the result as outcomes.
pub struct TaskStep;

#[async_trait]
impl Step for TaskStep {
    async fn execute(&self, invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let descriptor = invocation
            .parameters
            .get("task")
            .cloned()
            .ok_or_else(|| StepError::InvalidParameters("TASK requires 'task'".to_string()))?;
        let descriptor: TaskDescriptor = serde_json::from_value(descriptor)
            .map_err(|e| StepError::InvalidParameters(e.to_string()))?;
        Ok(StepOutcome::Task(descriptor))
    }
}

#[derive(Debug, Default, Deserialize)]
struct AsyncParams {
    correlation_ids: Vec<String>,
}

/// Waits for externally notified correlation ids.
pub struct AsyncStep;

#[async_trait]
impl Step for AsyncStep {
    async fn execute(&self, invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let params: AsyncParams = params(invocation.parameters)?;
        if params.correlation_ids.is_empty() {
            return Err(StepError::InvalidParameters(
                "ASYNC requires at least one correlation id".to_string(),
            ));
        }
        Ok(StepOutcome::Async {
            correlation_ids: params.correlation_ids,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct SectionParams {
    child: String,
}

/// Runs one child node; the parent finishes with the child's status.
pub struct SectionStep;

#[async_trait]
impl Step for SectionStep {
    async fn execute(&self, invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let params: SectionParams = params(invocation.parameters)?;
        if params.child.is_empty() {
            return Err(StepError::InvalidParameters("SECTION requires 'child'".to_string()));
        }
        Ok(StepOutcome::Child {
            node_id: params.child,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ForkParams {
    children: Vec<String>,
    #[serde(default)]
    max_concurrency: Option<usize>,
}

/// Runs several child nodes side by side.
pub struct ForkStep;

#[async_trait]
impl Step for ForkStep {
    async fn execute(&self, invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let params: ForkParams = params(invocation.parameters)?;
        if params.children.is_empty() {
            return Err(StepError::InvalidParameters("FORK requires children".to_string()));
        }
        if params.max_concurrency == Some(0) {
            return Err(StepError::InvalidParameters(
                "max_concurrency must be positive".to_string(),
            ));
        }
        Ok(StepOutcome::Children {
            children: params.children.into_iter().map(ChildSpawn::node).collect(),
            max_concurrency: params.max_concurrency,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct StrategyParams {
    child: String,
    /// Axis name to values; one iteration per combination
    #[serde(default)]
    matrix: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    repeat: Option<u32>,
    #[serde(default)]
    max_concurrency: Option<usize>,
}

/// Expands one child node into matrix or repeat iterations.
pub struct StrategyStep;

impl StrategyStep {
    fn combinations(matrix: &BTreeMap<String, Vec<String>>) -> Vec<Vec<u32>> {
        let mut combinations: Vec<Vec<u32>> = vec![Vec::new()];
        for values in matrix.values() {
            let mut next = Vec::with_capacity(combinations.len() * values.len());
            for prefix in &combinations {
                for index in 0..values.len() as u32 {
                    let mut combination = prefix.clone();
                    combination.push(index);
                    next.push(combination);
                }
            }
            combinations = next;
        }
        combinations
    }
}

#[async_trait]
impl Step for StrategyStep {
    async fn execute(&self, invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let params: StrategyParams = params(invocation.parameters)?;
        if params.child.is_empty() {
            return Err(StepError::InvalidParameters("STRATEGY requires 'child'".to_string()));
        }
        let spawns: Vec<ChildSpawn> = if !params.matrix.is_empty() {
            if params.matrix.values().any(Vec::is_empty) {
                return Err(StepError::InvalidParameters(
                    "Matrix axes cannot be empty".to_string(),
                ));
            }
            let combinations = Self::combinations(&params.matrix);
            let total = combinations.len() as u32;
            combinations
                .into_iter()
                .enumerate()
                .map(|(iteration, combination)| {
                    let matrix_values = params
                        .matrix
                        .iter()
                        .zip(&combination)
                        .map(|((axis, values), index)| (axis.clone(), values[*index as usize].clone()))
                        .collect();
                    ChildSpawn {
                        node_id: params.child.clone(),
                        strategy: Some(StrategyMetadata {
                            current_iteration: iteration as u32,
                            total_iterations: total,
                            matrix: Some(MatrixMetadata {
                                matrix_values,
                                matrix_combination: combination,
                                node_name: None,
                            }),
                        }),
                    }
                })
                .collect()
        } else {
            let total = params.repeat.unwrap_or(1).max(1);
            (0..total)
                .map(|iteration| ChildSpawn {
                    node_id: params.child.clone(),
                    strategy: Some(StrategyMetadata {
                        current_iteration: iteration,
                        total_iterations: total,
                        matrix: None,
                    }),
                })
                .collect()
        };
        Ok(StepOutcome::Children {
            children: spawns,
            max_concurrency: params.max_concurrency,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct TaskChainParams {
    tasks: Vec<TaskDescriptor>,
}

/// Runs `tasks` one after another; each link sees the previous link's result.
pub struct TaskChainStep;

#[async_trait]
impl Step for TaskChainStep {
    async fn execute(&self, invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let params: TaskChainParams = params(invocation.parameters)?;
        let descriptor = params
            .tasks
            .get(invocation.chain_index)
            .cloned()
            .ok_or_else(|| StepError::InvalidParameters(format!(
                "No task for chain link {}",
                invocation.chain_index
            )))?;
        // The previous link's results ride along as pass-through
        let previous: Map<String, Value> = invocation
            .responses
            .iter()
            .map(|(id, data)| (id.clone(), data.payload.clone()))
            .collect();
        Ok(StepOutcome::TaskLink {
            descriptor,
            pass_through: Value::Object(previous),
            chain_end: invocation.chain_index + 1 >= params.tasks.len(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChildChainParams {
    children: Vec<String>,
}

/// Runs child nodes strictly one after another.
pub struct ChildChainStep;

#[async_trait]
impl Step for ChildChainStep {
    async fn execute(&self, invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let params: ChildChainParams = params(invocation.parameters)?;
        let node_id = params
            .children
            .get(invocation.chain_index)
            .cloned()
            .ok_or_else(|| StepError::InvalidParameters(format!(
                "No child for chain link {}",
                invocation.chain_index
            )))?;
        Ok(StepOutcome::ChildLink {
            node_id,
            pass_through: invocation.pass_through.clone(),
            chain_end: invocation.chain_index + 1 >= params.children.len(),
        })
    }
}
