//! Step types keyed by name, built once at startup.

use crate::error::EngineError;
use crate::plan::Plan;
use crate::step::builtin;
use crate::step::Step;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: BTreeMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in demo steps
    pub fn with_builtins() -> Self {
        Self::new()
            .register(builtin::NOOP, Arc::new(builtin::NoopStep))
            .register(builtin::ECHO, Arc::new(builtin::EchoStep))
            .register(builtin::FAIL, Arc::new(builtin::FailStep))
            .register(builtin::TASK, Arc::new(builtin::TaskStep))
            .register(builtin::ASYNC, Arc::new(builtin::AsyncStep))
            .register(builtin::SECTION, Arc::new(builtin::SectionStep))
            .register(builtin::FORK, Arc::new(builtin::ForkStep))
            .register(builtin::STRATEGY, Arc::new(builtin::StrategyStep))
            .register(builtin::TASK_CHAIN, Arc::new(builtin::TaskChainStep))
            .register(builtin::CHILD_CHAIN, Arc::new(builtin::ChildChainStep))
    }

    pub fn register(mut self, type_name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        self.steps.insert(type_name.into(), step);
        self
    }

    pub fn get(&self, type_name: &str) -> Result<Arc<dyn Step>, EngineError> {
        self.steps
            .get(type_name)
            .cloned()
            .ok_or_else(|| EngineError::StepNotRegistered(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.steps.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<&str> {
        self.steps.keys().map(String::as_str).collect()
    }

    pub fn validate_plan(&self, plan: &Plan) -> Result<(), EngineError> {
        for node in plan.nodes.values() {
            if !self.contains(&node.step_type.type_name) {
                return Err(EngineError::StepNotRegistered(format!(
                    "{} (node '{}')",
                    node.step_type.type_name, node.identifier
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.steps.keys()).finish()
    }
}
