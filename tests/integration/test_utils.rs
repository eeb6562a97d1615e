//! Shared test utilities for integration tests
//!
//! Plans are written as JSON the same way a plan file would be, then handed
//! to an in-memory engine driven on the test task.

use cadence::config::CadenceConfig;
use cadence::engine::{Engine, EngineBuilder, Orchestrator, PlanExecution};
use cadence::execution::{NodeExecution, Status};
use cadence::interrupt::{Interrupt, InterruptRequest};
use cadence::plan::Plan;
use cadence::store::Storage;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// A plan node as it appears in a plan file
pub fn node(id: &str, step: &str, facilitator: &str, step_parameters: Value) -> Value {
    json!({
        "uuid": id,
        "identifier": id,
        "step_type": { "type": step, "category": "STEP" },
        "step_parameters": step_parameters,
        "facilitator_obtainments": [{ "type": facilitator }],
        "adviser_obtainments": []
    })
}

/// Attach adviser obtainments, e.g. `[{"type": "RETRY", "parameters": {...}}]`
pub fn advised(mut node: Value, advisers: Value) -> Value {
    node["adviser_obtainments"] = advisers;
    node
}

/// Shorthand for a NEXT_STEP obtainment pointing at `next`
pub fn then(node: Value, next: &str) -> Value {
    advised(
        node,
        json!([{ "type": "NEXT_STEP", "parameters": { "next_node_id": next } }]),
    )
}

pub fn in_group(mut node: Value, group: &str) -> Value {
    node["group"] = json!(group);
    node
}

pub fn plan(uuid: &str, start: &str, nodes: Vec<Value>) -> Plan {
    plan_with_barriers(uuid, start, nodes, json!({}))
}

pub fn plan_with_barriers(uuid: &str, start: &str, nodes: Vec<Value>, barriers: Value) -> Plan {
    let nodes: serde_json::Map<String, Value> = nodes
        .into_iter()
        .map(|n| (n["uuid"].as_str().unwrap().to_string(), n))
        .collect();
    serde_json::from_value(json!({
        "uuid": uuid,
        "start_node_id": start,
        "nodes": nodes,
        "barriers": barriers
    }))
    .unwrap()
}

/// Engine plus an orchestrator driving it on the test task
pub struct Harness {
    pub engine: Arc<Engine>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(CadenceConfig::default(), |b| b)
    }

    pub fn with<F>(config: CadenceConfig, customize: F) -> Self
    where
        F: FnOnce(EngineBuilder) -> EngineBuilder,
    {
        Self::on_storage(Storage::in_memory(), config, customize)
    }

    pub fn on_storage<F>(storage: Storage, config: CadenceConfig, customize: F) -> Self
    where
        F: FnOnce(EngineBuilder) -> EngineBuilder,
    {
        let engine = Arc::new(customize(Engine::builder(storage, config)).build().unwrap());
        let orchestrator = Orchestrator::new(Arc::clone(&engine)).unwrap();
        Self { engine, orchestrator }
    }

    pub fn start(&self, plan: Plan) -> PlanExecution {
        self.engine.start_plan_execution(plan, BTreeMap::new()).unwrap()
    }

    pub async fn settle(&self) {
        assert!(
            self.orchestrator.run_until_idle(IDLE_TIMEOUT).await.unwrap(),
            "engine did not settle"
        );
    }

    pub fn execution(&self, id: &str) -> PlanExecution {
        self.engine.plan_executions().require(id).unwrap()
    }

    pub fn nodes(&self, plan_execution_id: &str) -> Vec<NodeExecution> {
        let mut nodes = self.engine.nodes().for_plan_execution(plan_execution_id).unwrap();
        nodes.sort_by_key(|n| (n.created_at, n.retry_index()));
        nodes
    }

    /// Current attempt of a plan node
    pub fn node(&self, plan_execution_id: &str, node_id: &str) -> NodeExecution {
        self.attempts(plan_execution_id, node_id)
            .into_iter()
            .find(|n| !n.old_retry)
            .unwrap_or_else(|| panic!("no current attempt of {}", node_id))
    }

    pub fn attempts(&self, plan_execution_id: &str, node_id: &str) -> Vec<NodeExecution> {
        let mut attempts: Vec<NodeExecution> = self
            .nodes(plan_execution_id)
            .into_iter()
            .filter(|n| n.node_id == node_id)
            .collect();
        attempts.sort_by_key(|n| n.retry_index());
        attempts
    }

    pub fn status(&self, plan_execution_id: &str, node_id: &str) -> Status {
        self.node(plan_execution_id, node_id).status
    }

    pub async fn interrupt(&self, request: InterruptRequest) -> Interrupt {
        let interrupt = self.engine.register_interrupt(request).unwrap();
        self.settle().await;
        self.engine.interrupts().store().get(&interrupt.uuid).unwrap()
    }
}
