//! Facilitators
//!
//! A facilitator decides *how* a node runs: which execution mode, whether to
//! wait before starting, and what data to pass through to the strategy. Each
//! plan node lists obtainments in preference order; the first whose
//! condition holds and whose facilitator accepts the parameters wins.

pub mod builtin;
pub mod registry;

pub use builtin::{BarrierFacilitator, ModeFacilitator, ResourceRestraintFacilitator};
pub use registry::FacilitatorRegistry;

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::execution::ExecutionMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FacilitatorType {
    Sync,
    Async,
    Child,
    Children,
    ChildChain,
    Task,
    TaskChain,
    Barrier,
    ResourceRestraint,
}

impl FacilitatorType {
    pub const ALL: [FacilitatorType; 9] = [
        FacilitatorType::Sync,
        FacilitatorType::Async,
        FacilitatorType::Child,
        FacilitatorType::Children,
        FacilitatorType::ChildChain,
        FacilitatorType::Task,
        FacilitatorType::TaskChain,
        FacilitatorType::Barrier,
        FacilitatorType::ResourceRestraint,
    ];

    /// Execution mode a facilitator of this type produces
    pub fn mode(&self) -> ExecutionMode {
        match self {
            FacilitatorType::Sync => ExecutionMode::Sync,
            FacilitatorType::Async => ExecutionMode::Async,
            FacilitatorType::Child => ExecutionMode::Child,
            FacilitatorType::Children => ExecutionMode::Children,
            FacilitatorType::ChildChain => ExecutionMode::ChildChain,
            FacilitatorType::Task => ExecutionMode::Task,
            FacilitatorType::TaskChain => ExecutionMode::TaskChain,
            FacilitatorType::Barrier => ExecutionMode::Barrier,
            FacilitatorType::ResourceRestraint => ExecutionMode::ResourceRestraint,
        }
    }
}

impl std::fmt::Display for FacilitatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mode().as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorResponse {
    pub execution_mode: ExecutionMode,
    /// Delay before the strategy is invoked
    #[serde(default)]
    pub initial_wait_ms: u64,
    #[serde(default)]
    pub pass_through: Value,
}

pub trait Facilitator: Send + Sync {
    /// Applicability beyond the obtainment condition
    fn can_facilitate(&self, _context: &ExecutionContext, _step_parameters: &Value) -> bool {
        true
    }

    fn facilitate(
        &self,
        context: &ExecutionContext,
        step_parameters: &Value,
        parameters: &Value,
    ) -> Result<FacilitatorResponse, EngineError>;
}
