//! Explicit facilitator table, built once at startup.

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::execution::ExecutionMode;
use crate::facilitator::{
    BarrierFacilitator, Facilitator, FacilitatorResponse, FacilitatorType, ModeFacilitator,
    ResourceRestraintFacilitator,
};
use crate::plan::{Plan, PlanNode};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Default)]
pub struct FacilitatorRegistry {
    facilitators: BTreeMap<FacilitatorType, Arc<dyn Facilitator>>,
}

impl FacilitatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in facilitator
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for kind in FacilitatorType::ALL {
            let facilitator: Arc<dyn Facilitator> = match kind {
                FacilitatorType::Barrier => Arc::new(BarrierFacilitator),
                FacilitatorType::ResourceRestraint => Arc::new(ResourceRestraintFacilitator),
                other => Arc::new(ModeFacilitator::new(other.mode())),
            };
            registry = registry.register(kind, facilitator);
        }
        registry
    }

    pub fn register(mut self, kind: FacilitatorType, facilitator: Arc<dyn Facilitator>) -> Self {
        self.facilitators.insert(kind, facilitator);
        self
    }

    pub fn contains(&self, kind: FacilitatorType) -> bool {
        self.facilitators.contains_key(&kind)
    }

    /// Every obtainment in the plan must name a registered facilitator
    pub fn validate_plan(&self, plan: &Plan) -> Result<(), EngineError> {
        for node in plan.nodes.values() {
            for obtainment in &node.facilitator_obtainments {
                if !self.contains(obtainment.facilitator_type) {
                    return Err(EngineError::FacilitatorNotRegistered(format!(
                        "{} (node '{}')",
                        obtainment.facilitator_type, node.identifier
                    )));
                }
            }
        }
        Ok(())
    }

    /// First applicable obtainment wins; none applying is a configuration error.
    pub fn facilitate(
        &self,
        context: &ExecutionContext,
        node: &PlanNode,
    ) -> Result<FacilitatorResponse, EngineError> {
        for obtainment in &node.facilitator_obtainments {
            if let Some(condition) = &obtainment.condition {
                if !condition.matches(&node.step_parameters) {
                    continue;
                }
            }
            let facilitator = self
                .facilitators
                .get(&obtainment.facilitator_type)
                .ok_or_else(|| {
                    EngineError::FacilitatorNotRegistered(obtainment.facilitator_type.to_string())
                })?;
            if !facilitator.can_facilitate(context, &node.step_parameters) {
                continue;
            }
            let response =
                facilitator.facilitate(context, &node.step_parameters, &obtainment.parameters)?;
            debug!(
                node_id = %node.uuid,
                facilitator = %obtainment.facilitator_type,
                mode = %response.execution_mode,
                initial_wait_ms = response.initial_wait_ms,
                "Node facilitated"
            );
            return Ok(response);
        }
        Err(EngineError::NoFacilitator(node.identifier.clone()))
    }
}

impl std::fmt::Debug for FacilitatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.facilitators.keys()).finish()
    }
}

/// Modes a registry can hand out, for diagnostics
pub fn modes(registry: &FacilitatorRegistry) -> Vec<ExecutionMode> {
    registry.facilitators.keys().map(|k| k.mode()).collect()
}
