//! Execution Context
//!
//! The ordered stack of levels (plan → stage → step group → step → strategy
//! iteration) a node execution runs under. Contexts are immutable values;
//! every child scope derives a new one, so a node never observes a sibling's
//! levels and retries never disturb the parent chain.

pub mod level;
pub mod naming;

pub use level::{Level, LevelStack, MatrixMetadata, StepCategory, StepType, StrategyMetadata};
pub use naming::{fqn_from_levels, strategy_postfix};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ACCOUNT_ID: &str = "accountId";
pub const ORG_IDENTIFIER: &str = "orgIdentifier";
pub const PROJECT_IDENTIFIER: &str = "projectIdentifier";

const STAGES_GROUP: &str = "STAGES";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub plan_execution_id: String,
    pub plan_id: String,
    /// Tenant identifiers (account, org, project) carried to every node
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    levels: LevelStack,
}

impl ExecutionContext {
    pub fn new(
        plan_execution_id: impl Into<String>,
        plan_id: impl Into<String>,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            setup_abstractions,
            levels: LevelStack::empty(),
        }
    }

    pub fn levels(&self) -> &[Level] {
        self.levels.as_slice()
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Context of a child scope: this context plus `level`.
    pub fn for_child(&self, level: Level) -> Self {
        Self {
            levels: self.levels.pushed(level),
            ..self.clone_without_levels()
        }
    }

    /// Context of the enclosing scope: the current level removed.
    pub fn for_finish(&self) -> Self {
        self.truncated(self.depth().saturating_sub(1))
    }

    /// Context at a sibling position: the current level replaced by `level`.
    pub fn for_sibling(&self, level: Level) -> Self {
        self.for_finish().for_child(level)
    }

    /// Keep the first `depth` levels (clamped).
    pub fn truncated(&self, depth: usize) -> Self {
        Self {
            levels: self.levels.truncated(depth),
            ..self.clone_without_levels()
        }
    }

    fn clone_without_levels(&self) -> Self {
        Self {
            plan_execution_id: self.plan_execution_id.clone(),
            plan_id: self.plan_id.clone(),
            setup_abstractions: self.setup_abstractions.clone(),
            levels: LevelStack::empty(),
        }
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels().last()
    }

    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    pub fn step_identifier(&self) -> Option<&str> {
        self.current_level().map(|l| l.identifier.as_str())
    }

    pub fn current_step_type(&self) -> Option<&StepType> {
        self.current_level().map(|l| &l.step_type)
    }

    pub fn current_group(&self) -> Option<&str> {
        self.current_level().and_then(|l| l.group.as_deref())
    }

    pub fn retry_index(&self) -> u32 {
        self.current_level().map(|l| l.retry_index).unwrap_or(0)
    }

    pub fn parent_runtime_id(&self) -> Option<&str> {
        let levels = self.levels();
        levels
            .len()
            .checked_sub(2)
            .map(|idx| levels[idx].runtime_id.as_str())
    }

    /// Innermost stage level
    pub fn stage_level(&self) -> Option<&Level> {
        self.levels()
            .iter()
            .rev()
            .find(|l| l.step_type.category == StepCategory::Stage)
    }

    /// Innermost strategy level
    pub fn strategy_level(&self) -> Option<&Level> {
        self.levels()
            .iter()
            .rev()
            .find(|l| l.step_type.category == StepCategory::Strategy || l.strategy.is_some())
    }

    /// True when the current (strategy) level expands stages rather than steps:
    /// the nearest grouped level above it, skipping forks, is `STAGES`.
    pub fn is_current_strategy_at_stage(&self) -> bool {
        let levels = self.levels();
        if levels.len() < 2 {
            return false;
        }
        for level in levels[..levels.len() - 1].iter().rev() {
            if level.step_type.category == StepCategory::Fork && level.group.is_none() {
                continue;
            }
            return level.group.as_deref() == Some(STAGES_GROUP);
        }
        false
    }

    /// Nearest level (innermost first) opening `group`, with its index
    pub fn nearest_level_in_group(&self, group: &str) -> Option<(usize, &Level)> {
        self.levels()
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.group.as_deref() == Some(group))
    }

    pub fn contains_runtime_id(&self, runtime_id: &str) -> bool {
        self.levels().iter().any(|l| l.runtime_id == runtime_id)
    }

    pub fn fqn(&self) -> String {
        fqn_from_levels(self.levels())
    }

    pub fn setup_abstraction(&self, key: &str) -> Option<&str> {
        self.setup_abstractions.get(key).map(String::as_str)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstraction(ACCOUNT_ID)
    }

    pub fn org_identifier(&self) -> Option<&str> {
        self.setup_abstraction(ORG_IDENTIFIER)
    }

    pub fn project_identifier(&self) -> Option<&str> {
        self.setup_abstraction(PROJECT_IDENTIFIER)
    }

    #[cfg(test)]
    pub(crate) fn levels_shared_with(&self, other: &ExecutionContext) -> bool {
        self.levels.shares_arena_with(&other.levels)
    }
}
