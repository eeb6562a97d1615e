//! Levels and the arena-backed level stack.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Coarse classification of a step, used to locate stage/strategy levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCategory {
    Pipeline,
    Stage,
    StepGroup,
    #[default]
    Step,
    Strategy,
    Fork,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct StepType {
    /// Name the step registry resolves, e.g. `SHELL_SCRIPT`
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub category: StepCategory,
}

impl StepType {
    pub fn new(type_name: impl Into<String>, category: StepCategory) -> Self {
        Self {
            type_name: type_name.into(),
            category,
        }
    }
}

/// Matrix expansion coordinates of a strategy iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MatrixMetadata {
    #[serde(default)]
    pub matrix_values: BTreeMap<String, String>,
    #[serde(default)]
    pub matrix_combination: Vec<u32>,
    #[serde(default)]
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StrategyMetadata {
    pub current_iteration: u32,
    pub total_iterations: u32,
    #[serde(default)]
    pub matrix: Option<MatrixMetadata>,
}

/// One entry of the execution context stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub setup_id: String,
    pub runtime_id: String,
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default)]
    pub retry_index: u32,
    /// Scope group the level opens, e.g. `STAGES`, `STEPS`
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub start_ts: u64,
    /// Left out of fully qualified names
    #[serde(default)]
    pub skip_expression_chain: bool,
    #[serde(default)]
    pub strategy: Option<StrategyMetadata>,
}

impl Level {
    pub fn new(
        setup_id: impl Into<String>,
        runtime_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
    ) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id: runtime_id.into(),
            identifier: identifier.into(),
            step_type,
            retry_index: 0,
            group: None,
            start_ts: 0,
            skip_expression_chain: false,
            strategy: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_retry_index(mut self, retry_index: u32) -> Self {
        self.retry_index = retry_index;
        self
    }

    pub fn with_start_ts(mut self, start_ts: u64) -> Self {
        self.start_ts = start_ts;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyMetadata) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn skipping_expression_chain(mut self) -> Self {
        self.skip_expression_chain = true;
        self
    }
}

/// Immutable view `arena[..len]`.
///
/// Truncating shares the arena; pushing copies the visible prefix into a new
/// arena, so a derived stack never observes levels appended by a sibling.
#[derive(Clone)]
pub struct LevelStack {
    arena: Arc<[Level]>,
    len: usize,
}

impl LevelStack {
    pub fn empty() -> Self {
        Self {
            arena: Arc::from(Vec::new()),
            len: 0,
        }
    }

    pub fn from_levels(levels: Vec<Level>) -> Self {
        let len = levels.len();
        Self {
            arena: Arc::from(levels),
            len,
        }
    }

    pub fn as_slice(&self) -> &[Level] {
        &self.arena[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pushed(&self, level: Level) -> Self {
        let mut levels = Vec::with_capacity(self.len + 1);
        levels.extend_from_slice(self.as_slice());
        levels.push(level);
        Self::from_levels(levels)
    }

    /// Keep the first `depth` levels, clamped to the current length.
    pub fn truncated(&self, depth: usize) -> Self {
        Self {
            arena: Arc::clone(&self.arena),
            len: depth.min(self.len),
        }
    }

    #[cfg(test)]
    pub(crate) fn shares_arena_with(&self, other: &LevelStack) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena)
    }
}

impl std::fmt::Debug for LevelStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl PartialEq for LevelStack {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for LevelStack {}

impl Serialize for LevelStack {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_slice().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LevelStack {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Level>::deserialize(deserializer).map(LevelStack::from_levels)
    }
}
