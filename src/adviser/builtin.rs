//! Built-in advisers.

use crate::adviser::{parameters, Advise, Adviser, AdviserType, AdvisingEvent, RepairAction};
use crate::config::InterventionConfig;
use crate::error::EngineError;
use crate::execution::{ErrorClass, FailureType, Status};
use serde::Deserialize;

/// Broken, and not because of a configuration problem
fn is_adviseable_failure(event: &AdvisingEvent<'_>, failure_types: &[FailureType]) -> bool {
    if !event.to_status.is_broken() {
        return false;
    }
    match event.failure_info() {
        Some(info) => info.class != ErrorClass::Configuration && info.has_any_type(failure_types),
        None => failure_types.is_empty(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct NextStepParameters {
    #[serde(default)]
    next_node_id: Option<String>,
}

/// Proceed to a sibling after a positive outcome
pub struct NextStepAdviser;

impl Adviser for NextStepAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
        Ok(event.to_status.is_positive())
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<Advise, EngineError> {
        let params: NextStepParameters = parameters(AdviserType::NextStep, event.parameters)?;
        Ok(Advise::NextStep {
            next_node_id: params.next_node_id,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RetryParameters {
    #[serde(default)]
    retry_count: u32,
    /// Wait before each attempt; the last entry repeats
    #[serde(default)]
    wait_intervals_ms: Vec<u64>,
    /// Empty matches every failure type
    #[serde(default)]
    failure_types: Vec<FailureType>,
    #[serde(default)]
    repair_action_after_retry: RepairAction,
    #[serde(default)]
    next_node_id: Option<String>,
}

pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
        let params: RetryParameters = parameters(AdviserType::Retry, event.parameters)?;
        let retryable = event.failure_info().map(|f| f.retryable).unwrap_or(true);
        Ok(retryable && is_adviseable_failure(event, &params.failure_types))
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<Advise, EngineError> {
        let params: RetryParameters = parameters(AdviserType::Retry, event.parameters)?;
        let attempt = event.retry_index();
        if attempt >= params.retry_count {
            return Ok(params
                .repair_action_after_retry
                .into_advise(params.next_node_id));
        }
        let wait_ms = params
            .wait_intervals_ms
            .get(attempt as usize)
            .or_else(|| params.wait_intervals_ms.last())
            .copied()
            .unwrap_or(0);
        Ok(Advise::Retry { wait_ms })
    }
}

#[derive(Debug, Default, Deserialize)]
struct IgnoreFailureParameters {
    #[serde(default)]
    failure_types: Vec<FailureType>,
    #[serde(default)]
    next_node_id: Option<String>,
}

pub struct IgnoreFailureAdviser;

impl Adviser for IgnoreFailureAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
        let params: IgnoreFailureParameters =
            parameters(AdviserType::IgnoreFailure, event.parameters)?;
        Ok(is_adviseable_failure(event, &params.failure_types))
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<Advise, EngineError> {
        let params: IgnoreFailureParameters =
            parameters(AdviserType::IgnoreFailure, event.parameters)?;
        Ok(Advise::MarkSuccess {
            next_node_id: params.next_node_id,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct InterventionParameters {
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    repair_action: Option<RepairAction>,
    #[serde(default)]
    failure_types: Vec<FailureType>,
    #[serde(default)]
    next_node_id: Option<String>,
}

impl InterventionParameters {
    fn into_advise(self, defaults: &InterventionConfig) -> Advise {
        Advise::InterventionWait {
            timeout_ms: self.timeout_ms.unwrap_or(defaults.default_timeout_ms),
            repair_action: self
                .repair_action
                .unwrap_or(defaults.default_repair_action),
            next_node_id: self.next_node_id,
        }
    }
}

/// Suspend any broken node for a manual decision
pub struct InterventionWaitAdviser {
    defaults: InterventionConfig,
}

impl InterventionWaitAdviser {
    pub fn new(defaults: InterventionConfig) -> Self {
        Self { defaults }
    }
}

impl Adviser for InterventionWaitAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
        Ok(is_adviseable_failure(event, &[]))
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<Advise, EngineError> {
        let params: InterventionParameters =
            parameters(AdviserType::InterventionWait, event.parameters)?;
        Ok(params.into_advise(&self.defaults))
    }
}

/// Like intervention wait, but only for allow-listed failure types
pub struct ManualInterventionAdviser {
    defaults: InterventionConfig,
}

impl ManualInterventionAdviser {
    pub fn new(defaults: InterventionConfig) -> Self {
        Self { defaults }
    }
}

impl Adviser for ManualInterventionAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
        let params: InterventionParameters =
            parameters(AdviserType::ManualIntervention, event.parameters)?;
        if params.failure_types.is_empty() {
            return Err(EngineError::ConfigError(
                "MANUAL_INTERVENTION adviser needs a non-empty failure_types allow-list"
                    .to_string(),
            ));
        }
        Ok(is_adviseable_failure(event, &params.failure_types))
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<Advise, EngineError> {
        let params: InterventionParameters =
            parameters(AdviserType::ManualIntervention, event.parameters)?;
        Ok(params.into_advise(&self.defaults))
    }
}

#[derive(Debug, Default, Deserialize)]
struct EndPlanParameters {
    /// Statuses that end the plan; empty means any broken status
    #[serde(default)]
    on_statuses: Vec<Status>,
}

pub struct EndPlanAdviser;

impl Adviser for EndPlanAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
        let params: EndPlanParameters = parameters(AdviserType::EndPlan, event.parameters)?;
        Ok(if params.on_statuses.is_empty() {
            event.to_status.is_broken()
        } else {
            params.on_statuses.contains(&event.to_status)
        })
    }

    fn on_advise(&self, _event: &AdvisingEvent<'_>) -> Result<Advise, EngineError> {
        Ok(Advise::EndPlan { is_abort: false })
    }
}
