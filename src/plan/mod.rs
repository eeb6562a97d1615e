//! Plan Graph
//!
//! The immutable compiled form of a pipeline: nodes keyed by id, each naming
//! its step type, its facilitator obtainments (how it may run) and its adviser
//! obtainments (what happens after). Plans are validated structurally when
//! saved; registry checks happen when an engine loads them.

pub mod repository;

pub use repository::PlanRepository;

use crate::adviser::AdviserType;
use crate::context::{Level, StepType};
use crate::error::EngineError;
use crate::facilitator::FacilitatorType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON-pointer equality test against a node's step parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterCondition {
    pub pointer: String,
    pub equals: Value,
}

impl ParameterCondition {
    pub fn matches(&self, step_parameters: &Value) -> bool {
        step_parameters.pointer(&self.pointer) == Some(&self.equals)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorObtainment {
    #[serde(rename = "type")]
    pub facilitator_type: FacilitatorType,
    #[serde(default)]
    pub parameters: Value,
    /// Obtainment applies only when this holds
    #[serde(default)]
    pub condition: Option<ParameterCondition>,
}

impl FacilitatorObtainment {
    pub fn of(facilitator_type: FacilitatorType) -> Self {
        Self {
            facilitator_type,
            parameters: Value::Null,
            condition: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    #[serde(rename = "type")]
    pub adviser_type: AdviserType,
    #[serde(default)]
    pub parameters: Value,
}

impl AdviserObtainment {
    pub fn new(adviser_type: AdviserType, parameters: Value) -> Self {
        Self {
            adviser_type,
            parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub uuid: String,
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    pub step_type: StepType,
    #[serde(default)]
    pub step_parameters: Value,
    /// Scope group this node opens for output resolution
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub skip_expression_chain: bool,
    pub facilitator_obtainments: Vec<FacilitatorObtainment>,
    #[serde(default)]
    pub adviser_obtainments: Vec<AdviserObtainment>,
}

impl PlanNode {
    /// Level this node contributes for one attempt
    pub fn level(&self, runtime_id: &str, retry_index: u32, start_ts: u64) -> Level {
        let mut level = Level::new(
            self.uuid.clone(),
            runtime_id,
            self.identifier.clone(),
            self.step_type.clone(),
        )
        .with_retry_index(retry_index)
        .with_start_ts(start_ts);
        level.group = self.group.clone();
        level.skip_expression_chain = self.skip_expression_chain;
        level
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.identifier
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub uuid: String,
    pub start_node_id: String,
    pub nodes: BTreeMap<String, PlanNode>,
    /// Barrier id to the plan node ids that must all arrive
    #[serde(default)]
    pub barriers: BTreeMap<String, Vec<String>>,
}

impl Plan {
    pub fn node(&self, node_id: &str) -> Result<&PlanNode, EngineError> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| EngineError::PlanNodeNotFound {
                plan_id: self.uuid.clone(),
                node_id: node_id.to_string(),
            })
    }

    pub fn start_node(&self) -> Result<&PlanNode, EngineError> {
        self.node(&self.start_node_id)
    }

    /// Structural checks; registry checks belong to the engine.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.uuid.is_empty() {
            return Err(EngineError::InvalidPlan("Plan id cannot be empty".to_string()));
        }
        if !self.nodes.contains_key(&self.start_node_id) {
            return Err(EngineError::InvalidPlan(format!(
                "Start node '{}' is not part of plan '{}'",
                self.start_node_id, self.uuid
            )));
        }
        for (key, node) in &self.nodes {
            if key != &node.uuid {
                return Err(EngineError::InvalidPlan(format!(
                    "Node keyed '{}' declares uuid '{}'",
                    key, node.uuid
                )));
            }
            if node.identifier.trim().is_empty() {
                return Err(EngineError::InvalidPlan(format!(
                    "Node '{}' has an empty identifier",
                    key
                )));
            }
            if node.facilitator_obtainments.is_empty() {
                return Err(EngineError::InvalidPlan(format!(
                    "Node '{}' has no facilitator obtainments",
                    key
                )));
            }
        }
        for (barrier, participants) in &self.barriers {
            if participants.is_empty() {
                return Err(EngineError::InvalidPlan(format!(
                    "Barrier '{}' has no participants",
                    barrier
                )));
            }
            if let Some(missing) = participants.iter().find(|p| !self.nodes.contains_key(*p)) {
                return Err(EngineError::InvalidPlan(format!(
                    "Barrier '{}' names unknown node '{}'",
                    barrier, missing
                )));
            }
        }
        Ok(())
    }
}
