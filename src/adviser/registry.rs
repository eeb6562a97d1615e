//! Explicit adviser table, built once at startup.

use crate::adviser::{
    Advise, Adviser, AdviserType, AdvisingEvent, EndPlanAdviser, IgnoreFailureAdviser,
    InterventionWaitAdviser, ManualInterventionAdviser, NextStepAdviser, RetryAdviser,
};
use crate::config::InterventionConfig;
use crate::error::EngineError;
use crate::execution::{NodeExecution, Status};
use crate::plan::{AdviserObtainment, Plan};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Default)]
pub struct AdviserRegistry {
    advisers: BTreeMap<AdviserType, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(intervention: &InterventionConfig) -> Self {
        Self::new()
            .register(AdviserType::NextStep, Arc::new(NextStepAdviser))
            .register(AdviserType::Retry, Arc::new(RetryAdviser))
            .register(AdviserType::IgnoreFailure, Arc::new(IgnoreFailureAdviser))
            .register(
                AdviserType::InterventionWait,
                Arc::new(InterventionWaitAdviser::new(intervention.clone())),
            )
            .register(
                AdviserType::ManualIntervention,
                Arc::new(ManualInterventionAdviser::new(intervention.clone())),
            )
            .register(AdviserType::EndPlan, Arc::new(EndPlanAdviser))
    }

    pub fn register(mut self, kind: AdviserType, adviser: Arc<dyn Adviser>) -> Self {
        self.advisers.insert(kind, adviser);
        self
    }

    pub fn contains(&self, kind: AdviserType) -> bool {
        self.advisers.contains_key(&kind)
    }

    pub fn validate_plan(&self, plan: &Plan) -> Result<(), EngineError> {
        for node in plan.nodes.values() {
            for obtainment in &node.adviser_obtainments {
                if !self.contains(obtainment.adviser_type) {
                    return Err(EngineError::AdviserNotRegistered(format!(
                        "{} (node '{}')",
                        obtainment.adviser_type, node.identifier
                    )));
                }
            }
        }
        Ok(())
    }

    /// First adviser in obtainment order that claims the event.
    ///
    /// `None` means nobody advised; the branch simply ends.
    pub fn advise(
        &self,
        node: &NodeExecution,
        from_status: Option<Status>,
        obtainments: &[AdviserObtainment],
    ) -> Result<Option<(AdviserType, Advise)>, EngineError> {
        for obtainment in obtainments {
            let adviser = self
                .advisers
                .get(&obtainment.adviser_type)
                .ok_or_else(|| EngineError::AdviserNotRegistered(obtainment.adviser_type.to_string()))?;
            let event = AdvisingEvent {
                node,
                from_status,
                to_status: node.status,
                parameters: &obtainment.parameters,
            };
            if adviser.can_advise(&event)? {
                let advise = adviser.on_advise(&event)?;
                debug!(
                    node_execution_id = %node.uuid,
                    adviser = %obtainment.adviser_type,
                    advise = advise.name(),
                    "Adviser applied"
                );
                return Ok(Some((obtainment.adviser_type, advise)));
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for AdviserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.advisers.keys()).finish()
    }
}
