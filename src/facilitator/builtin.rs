//! Built-in facilitators, one per execution mode.

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::execution::ExecutionMode;
use crate::facilitator::{Facilitator, FacilitatorResponse};
use serde::Deserialize;
use serde_json::Value;

/// Obtainment parameters every built-in understands
#[derive(Debug, Default, Deserialize)]
struct CommonParameters {
    #[serde(default)]
    initial_wait_ms: u64,
    #[serde(default)]
    pass_through: Value,
}

fn common(parameters: &Value) -> Result<CommonParameters, EngineError> {
    if parameters.is_null() {
        return Ok(CommonParameters::default());
    }
    serde_json::from_value(parameters.clone()).map_err(|e| {
        EngineError::ConfigError(format!("Invalid facilitator parameters: {}", e))
    })
}

fn respond(mode: ExecutionMode, parameters: &Value) -> Result<FacilitatorResponse, EngineError> {
    let params = common(parameters)?;
    Ok(FacilitatorResponse {
        execution_mode: mode,
        initial_wait_ms: params.initial_wait_ms,
        pass_through: params.pass_through,
    })
}

/// Always applies and answers with a fixed mode
pub struct ModeFacilitator {
    mode: ExecutionMode,
}

impl ModeFacilitator {
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode }
    }
}

impl Facilitator for ModeFacilitator {
    fn facilitate(
        &self,
        _context: &ExecutionContext,
        _step_parameters: &Value,
        parameters: &Value,
    ) -> Result<FacilitatorResponse, EngineError> {
        respond(self.mode, parameters)
    }
}

/// Applies only to nodes that name a barrier in `barrier_ref`
pub struct BarrierFacilitator;

impl Facilitator for BarrierFacilitator {
    fn can_facilitate(&self, _context: &ExecutionContext, step_parameters: &Value) -> bool {
        step_parameters
            .get("barrier_ref")
            .and_then(Value::as_str)
            .is_some()
    }

    fn facilitate(
        &self,
        _context: &ExecutionContext,
        _step_parameters: &Value,
        parameters: &Value,
    ) -> Result<FacilitatorResponse, EngineError> {
        respond(ExecutionMode::Barrier, parameters)
    }
}

/// Applies only to nodes that name a resource in `resource_unit`
pub struct ResourceRestraintFacilitator;

impl Facilitator for ResourceRestraintFacilitator {
    fn can_facilitate(&self, _context: &ExecutionContext, step_parameters: &Value) -> bool {
        step_parameters
            .get("resource_unit")
            .and_then(Value::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    fn facilitate(
        &self,
        _context: &ExecutionContext,
        _step_parameters: &Value,
        parameters: &Value,
    ) -> Result<FacilitatorResponse, EngineError> {
        respond(ExecutionMode::ResourceRestraint, parameters)
    }
}
