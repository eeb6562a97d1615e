//! Durable plan storage with an in-process cache.

use crate::error::EngineError;
use crate::plan::Plan;
use crate::store::{Collection, Storage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

const TREE_PLANS: &str = "plans";

pub struct PlanRepository {
    plans: Collection<Plan>,
    cache: RwLock<HashMap<String, Arc<Plan>>>,
}

impl PlanRepository {
    pub fn open(storage: &Storage) -> Result<Self, EngineError> {
        Ok(Self {
            plans: Collection::open(storage, TREE_PLANS)?,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Validate and persist. Plans are immutable: saving a different plan under
    /// an existing id is rejected.
    pub fn save(&self, plan: Plan) -> Result<Arc<Plan>, EngineError> {
        plan.validate()?;
        if !self.plans.insert_new(&plan.uuid, &plan)? {
            let existing = self.plans.require(&plan.uuid)?;
            if existing != plan {
                return Err(EngineError::InvalidPlan(format!(
                    "Plan '{}' already exists with different content",
                    plan.uuid
                )));
            }
        }
        info!(plan_id = %plan.uuid, nodes = plan.nodes.len(), "Plan saved");
        let plan = Arc::new(plan);
        self.cache
            .write()
            .insert(plan.uuid.clone(), Arc::clone(&plan));
        Ok(plan)
    }

    pub fn get(&self, plan_id: &str) -> Result<Arc<Plan>, EngineError> {
        if let Some(plan) = self.cache.read().get(plan_id) {
            return Ok(Arc::clone(plan));
        }
        let plan = self
            .plans
            .get(plan_id)?
            .ok_or_else(|| EngineError::PlanNotFound(plan_id.to_string()))?;
        let plan = Arc::new(plan);
        self.cache
            .write()
            .insert(plan_id.to_string(), Arc::clone(&plan));
        Ok(plan)
    }
}
