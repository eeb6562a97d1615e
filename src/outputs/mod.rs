//! Output Resolver
//!
//! Scoped, write-once values produced by one node and read by its
//! descendants. A value is stored under the runtime id of the level that
//! produced it; resolution walks the context from the innermost level
//! outwards and the nearest producer wins, like lexical scoping. Values
//! written with an empty context live at plan scope and are found last.

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::store::{Collection, Storage};
use crate::types::now_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const TREE_SWEEPING_OUTPUTS: &str = "sweeping_outputs";
const TREE_OUTCOMES: &str = "outcomes";
const PLAN_SCOPE: &str = "~plan";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub plan_execution_id: String,
    pub name: String,
    /// Runtime id of the producing level, or plan scope
    pub level_runtime_id: String,
    #[serde(default)]
    pub level_setup_id: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    pub value: Value,
    pub created_at: u64,
}

/// Handle returned by `consume`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub key: String,
    pub name: String,
    pub level_runtime_id: String,
}

/// What a consumer asks for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefObject {
    pub name: String,
    /// Only consider levels of this group
    #[serde(default)]
    pub group: Option<String>,
}

impl RefObject {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

#[derive(Clone)]
pub struct OutputResolver {
    records: Collection<OutputRecord>,
}

impl OutputResolver {
    /// Values steps publish for their descendants
    pub fn sweeping_outputs(storage: &Storage) -> Result<Self, EngineError> {
        Ok(Self {
            records: Collection::open(storage, TREE_SWEEPING_OUTPUTS)?,
        })
    }

    /// Step responses recorded by the engine
    pub fn outcomes(storage: &Storage) -> Result<Self, EngineError> {
        Ok(Self {
            records: Collection::open(storage, TREE_OUTCOMES)?,
        })
    }

    fn key(plan_execution_id: &str, runtime_id: &str, name: &str) -> String {
        format!("{}:{}:{}", plan_execution_id, runtime_id, name)
    }

    /// Write `value` at the current level, or at the nearest enclosing level
    /// of `group`. A second write to the same place is a conflict.
    pub fn consume(
        &self,
        context: &ExecutionContext,
        name: &str,
        value: Value,
        group: Option<&str>,
    ) -> Result<OutputRef, EngineError> {
        let level = match group {
            Some(group) => Some(
                context
                    .nearest_level_in_group(group)
                    .map(|(_, level)| level)
                    .ok_or_else(|| EngineError::GroupNotFound(group.to_string()))?,
            ),
            None => context.current_level(),
        };
        let runtime_id = level
            .map(|l| l.runtime_id.clone())
            .unwrap_or_else(|| PLAN_SCOPE.to_string());
        let key = Self::key(&context.plan_execution_id, &runtime_id, name);
        let record = OutputRecord {
            plan_execution_id: context.plan_execution_id.clone(),
            name: name.to_string(),
            level_runtime_id: runtime_id.clone(),
            level_setup_id: level.map(|l| l.setup_id.clone()),
            group: level.and_then(|l| l.group.clone()),
            value,
            created_at: now_millis(),
        };
        if !self.records.insert_new(&key, &record)? {
            return Err(EngineError::OutputConflict {
                name: name.to_string(),
                runtime_id,
            });
        }
        debug!(
            collection = self.records.name(),
            name,
            level_runtime_id = %record.level_runtime_id,
            "Output consumed"
        );
        Ok(OutputRef {
            key,
            name: name.to_string(),
            level_runtime_id: runtime_id,
        })
    }

    /// Nearest-ancestor lookup
    pub fn resolve(&self, context: &ExecutionContext, reference: &RefObject) -> Result<Value, EngineError> {
        self.resolve_optional(context, reference)?
            .ok_or_else(|| EngineError::OutputNotFound(reference.name.clone()))
    }

    pub fn resolve_optional(
        &self,
        context: &ExecutionContext,
        reference: &RefObject,
    ) -> Result<Option<Value>, EngineError> {
        Ok(self
            .resolve_record(context, reference)?
            .map(|record| record.value))
    }

    pub fn resolve_record(
        &self,
        context: &ExecutionContext,
        reference: &RefObject,
    ) -> Result<Option<OutputRecord>, EngineError> {
        for level in context.levels().iter().rev() {
            if let Some(group) = &reference.group {
                if level.group.as_deref() != Some(group.as_str()) {
                    continue;
                }
            }
            let key = Self::key(&context.plan_execution_id, &level.runtime_id, &reference.name);
            if let Some(record) = self.records.get(&key)? {
                return Ok(Some(record));
            }
        }
        if reference.group.is_none() {
            let key = Self::key(&context.plan_execution_id, PLAN_SCOPE, &reference.name);
            return Ok(self.records.get(&key)?);
        }
        Ok(None)
    }

    /// Everything produced at one level
    pub fn at_level(&self, plan_execution_id: &str, runtime_id: &str) -> Result<Vec<OutputRecord>, EngineError> {
        Ok(self
            .records
            .values_with_prefix(&format!("{}:{}:", plan_execution_id, runtime_id))?)
    }
}
