//! Applying interrupts.
//!
//! An interrupt is claimed once, applied, and always recorded with its
//! outcome. Anything that does not fit the target's current state is an
//! [`EngineError::InterruptRejected`] and lands in the record as the reason.

use super::Engine;
use crate::adviser::Advise;
use crate::bus::{publish_json, TOPIC_NOTIFY};
use crate::error::EngineError;
use crate::execution::{
    AdviseRecord, FailureInfo, FailureType, InterruptEffect, NodeExecution, Status, Transition,
};
use crate::interrupt::{Interrupt, InterruptType};
use crate::timer::TimerKind;
use crate::types::now_millis;
use crate::wait_notify::{NotifyCallback, NotifyEvent};
use serde_json::Value;
use tracing::{error, info, warn};

/// Statuses an `ExpireAll` reaches
const EXPIRABLE: &[Status] = &[
    Status::Queued,
    Status::Running,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::ResourceWaiting,
    Status::Paused,
];

const FAILABLE: &[Status] = &[
    Status::Running,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::ResourceWaiting,
];

fn rejected(reason: impl Into<String>) -> EngineError {
    EngineError::InterruptRejected(reason.into())
}

fn effect(interrupt: &Interrupt) -> InterruptEffect {
    InterruptEffect {
        interrupt_id: interrupt.uuid.clone(),
        interrupt_type: interrupt.interrupt_type,
        applied_at: now_millis(),
    }
}

impl Engine {
    /// Handle an interrupt published on the interrupts topic.
    pub fn process_interrupt(&self, interrupt_id: &str) -> Result<(), EngineError> {
        let Some(interrupt) = self.interrupts.store().claim(interrupt_id)? else {
            info!(interrupt_id, "Interrupt already claimed");
            return Ok(());
        };

        let result = self.apply_interrupt(&interrupt);
        let recorded = match &result {
            Ok(()) => Ok(()),
            Err(EngineError::InterruptRejected(reason)) => Err(reason.clone()),
            Err(err) => Err(err.to_string()),
        };
        self.interrupts.store().complete(interrupt_id, recorded)?;

        match result {
            Ok(()) => info!(
                interrupt_id,
                interrupt_type = %interrupt.interrupt_type,
                plan_execution_id = %interrupt.plan_execution_id,
                "Interrupt applied"
            ),
            Err(EngineError::InterruptRejected(reason)) => warn!(
                interrupt_id,
                interrupt_type = %interrupt.interrupt_type,
                reason = %reason,
                "Interrupt rejected"
            ),
            Err(err) => error!(
                interrupt_id,
                interrupt_type = %interrupt.interrupt_type,
                error = %err,
                "Interrupt failed"
            ),
        }
        Ok(())
    }

    fn apply_interrupt(&self, interrupt: &Interrupt) -> Result<(), EngineError> {
        let execution = self.plan_executions.require(&interrupt.plan_execution_id)?;
        if execution.is_final() {
            return Err(rejected(format!(
                "Plan execution already ended as {}",
                execution.status
            )));
        }
        let target = match &interrupt.node_execution_id {
            Some(id) => {
                let node = self
                    .nodes
                    .get(id)?
                    .ok_or_else(|| rejected(format!("Unknown node execution {}", id)))?;
                if node.plan_execution_id != interrupt.plan_execution_id {
                    return Err(rejected(format!(
                        "Node execution {} belongs to another plan execution",
                        id
                    )));
                }
                Some(node)
            }
            None => None,
        };

        match (interrupt.interrupt_type, target) {
            (InterruptType::Abort, Some(node)) => self.abort_branch(interrupt, &node),
            (InterruptType::AbortAll, None) => {
                self.abort_nodes(&interrupt.plan_execution_id, |_| true)?;
                self.conclude_plan(&interrupt.plan_execution_id, Status::Aborted)
            }
            (InterruptType::Pause, Some(node)) => self.pause_subtree(interrupt, &node),
            (InterruptType::Pause, None) => self.pause_plan(interrupt),
            (InterruptType::Resume, Some(node)) => self.resume_subtree(interrupt, &node),
            (InterruptType::Resume, None) => self.resume_plan(interrupt),
            (InterruptType::Retry, Some(node)) => self.retry_by_interrupt(interrupt, &node),
            (InterruptType::ExpireAll, None) => self.expire_all(interrupt),
            (InterruptType::CustomFailure, Some(node)) => self.custom_failure(interrupt, &node),
            (InterruptType::MarkSuccess, Some(node)) => self.decide_intervention(interrupt, &node, true),
            (InterruptType::MarkFailed, Some(node)) => self.decide_intervention(interrupt, &node, false),
            (kind, target) => Err(rejected(format!(
                "{} does not apply to {}",
                kind,
                if target.is_some() { "a node execution" } else { "a plan execution" }
            ))),
        }
    }

    /// Target and its live descendants to `Aborted`, deepest first. Only the
    /// target is advised, which ends its branch.
    fn abort_branch(&self, interrupt: &Interrupt, target: &NodeExecution) -> Result<(), EngineError> {
        if target.status.is_final() {
            return Err(rejected(format!("Node is already {}", target.status)));
        }
        let descendants: Vec<String> = self
            .nodes
            .descendants_without_old_retries(&target.plan_execution_id, &target.uuid)?
            .into_iter()
            .map(|n| n.uuid)
            .collect();
        let aborted = self.abort_nodes(&target.plan_execution_id, |n| descendants.contains(&n.uuid))?;

        let applied = effect(interrupt);
        let outcome = self.nodes.transition(&target.uuid, Status::Aborted, None, |n| {
            n.failure_info = Some(FailureInfo::interrupt("Aborted by operator", vec![FailureType::UserMarked]));
            n.interrupt_history.push(applied.clone());
        })?;
        match outcome {
            Transition::Applied(node) => {
                info!(node_execution_id = %node.uuid, descendants = aborted, "Node aborted");
                self.after_final(&node)
            }
            Transition::Rejected { current } => Err(rejected(format!("Node is {}", current))),
            Transition::Missing => Err(EngineError::NodeExecutionNotFound(target.uuid.clone())),
        }
    }

    /// Pause each node in `nodes` that can be paused; returns how many moved.
    fn pause_nodes(&self, interrupt: &Interrupt, nodes: &[NodeExecution]) -> Result<usize, EngineError> {
        let mut paused = 0;
        for node in nodes {
            let from = node.status;
            if node.old_retry || !from.can_transition_to(Status::Paused) {
                continue;
            }
            let applied = effect(interrupt);
            if let Transition::Applied(_) = self.nodes.transition(&node.uuid, Status::Paused, Some(&[from]), |n| {
                n.status_before_pause = Some(from);
                n.interrupt_history.push(applied.clone());
            })? {
                paused += 1;
            }
        }
        Ok(paused)
    }

    fn pause_subtree(&self, interrupt: &Interrupt, target: &NodeExecution) -> Result<(), EngineError> {
        if !target.status.can_transition_to(Status::Paused) {
            return Err(rejected(format!("A {} node cannot be paused", target.status)));
        }
        let mut nodes = vec![target.clone()];
        nodes.extend(
            self.nodes
                .descendants_without_old_retries(&target.plan_execution_id, &target.uuid)?,
        );
        let paused = self.pause_nodes(interrupt, &nodes)?;
        if paused == 0 {
            return Err(rejected("Node moved on before it could be paused"));
        }
        info!(node_execution_id = %target.uuid, paused, "Subtree paused");
        Ok(())
    }

    fn pause_plan(&self, interrupt: &Interrupt) -> Result<(), EngineError> {
        if !self.plan_executions.set_paused(&interrupt.plan_execution_id, true)? {
            return Err(rejected("Plan execution is already paused"));
        }
        let nodes = self.nodes.for_plan_execution(&interrupt.plan_execution_id)?;
        let paused = self.pause_nodes(interrupt, &nodes)?;
        info!(plan_execution_id = %interrupt.plan_execution_id, paused, "Plan paused");
        Ok(())
    }

    fn resume_subtree(&self, interrupt: &Interrupt, target: &NodeExecution) -> Result<(), EngineError> {
        if target.status != Status::Paused {
            return Err(rejected(format!("Node is {}, not paused", target.status)));
        }
        let mut nodes = vec![target.clone()];
        nodes.extend(
            self.nodes
                .descendants_without_old_retries(&target.plan_execution_id, &target.uuid)?,
        );
        let resumed = self.resume_nodes(interrupt, nodes)?;
        info!(node_execution_id = %target.uuid, resumed, "Subtree resumed");
        Ok(())
    }

    fn resume_plan(&self, interrupt: &Interrupt) -> Result<(), EngineError> {
        let flag_cleared = self.plan_executions.set_paused(&interrupt.plan_execution_id, false)?;
        let nodes = self.nodes.for_plan_execution(&interrupt.plan_execution_id)?;
        let resumed = self.resume_nodes(interrupt, nodes)?;
        if !flag_cleared && resumed == 0 {
            return Err(rejected("Nothing in the plan execution is paused"));
        }
        info!(plan_execution_id = %interrupt.plan_execution_id, resumed, "Plan resumed");
        Ok(())
    }

    /// Paused → Resumed → the status held before the pause, shallowest
    /// first, then replay whatever arrived meanwhile.
    fn resume_nodes(&self, interrupt: &Interrupt, mut nodes: Vec<NodeExecution>) -> Result<usize, EngineError> {
        nodes.retain(|n| n.status == Status::Paused && !n.old_retry);
        nodes.sort_by_key(|n| n.context.depth());

        let mut resumed = 0;
        for node in nodes {
            let applied = effect(interrupt);
            let Some(node) = self
                .nodes
                .transition(&node.uuid, Status::Resumed, Some(&[Status::Paused]), |n| {
                    n.interrupt_history.push(applied.clone());
                })?
                .applied()
            else {
                continue;
            };

            let before = node.status_before_pause.unwrap_or(Status::Running);
            let mut deferred_conclusion = None;
            let mut deferred_responses = None;
            let Some(node) = self
                .nodes
                .transition(&node.uuid, before, Some(&[Status::Resumed]), |n| {
                    n.status_before_pause = None;
                    deferred_conclusion = n.deferred_conclusion.take();
                    deferred_responses = n.deferred_responses.take();
                })?
                .applied()
            else {
                warn!(node_execution_id = %node.uuid, before = %before, "Could not restore status after pause");
                continue;
            };
            resumed += 1;

            if let Some(conclusion) = deferred_conclusion {
                self.conclude_node(&node.uuid, conclusion)?;
            } else if let Some(responses) = deferred_responses {
                let event = NotifyEvent {
                    wait_id: format!("deferred:{}", node.uuid),
                    callback: NotifyCallback::ResumeNode {
                        node_execution_id: node.uuid.clone(),
                    },
                    responses,
                };
                publish_json(self.bus.as_ref(), TOPIC_NOTIFY, &node.uuid, &event)?;
            } else if before == Status::Queued {
                self.publish_start(&node.plan_execution_id, &node.uuid)?;
            } else if before == Status::Running
                && node.executable_responses.is_empty()
                && self.timers.pending_for_node(&node.uuid)?.is_empty()
            {
                // Paused during its initial wait; the timer fired meanwhile
                self.timers.schedule(
                    TimerKind::InvokeStrategy,
                    &node.plan_execution_id,
                    &node.uuid,
                    now_millis(),
                )?;
            }
        }
        Ok(resumed)
    }

    /// New attempt for a node that failed or expired, directly or while
    /// waiting for an intervention entered from there.
    fn retry_by_interrupt(&self, interrupt: &Interrupt, target: &NodeExecution) -> Result<(), EngineError> {
        if target.old_retry {
            return Err(rejected("Node was already retried"));
        }
        let intervening = target.status == Status::InterventionWaiting;
        let broken_status = if intervening {
            target.status_before_intervention
        } else {
            Some(target.status)
        };
        if !matches!(broken_status, Some(Status::Failed) | Some(Status::Expired)) {
            return Err(rejected(format!("A {} node cannot be retried", target.status)));
        }
        if target.next_id.is_some() {
            return Err(rejected("Node already handed over to its next step"));
        }
        if let Some(notify_id) = &target.notify_id {
            if self.wait_notify.response(notify_id)?.is_some() {
                return Err(rejected("Node's branch already reported to its parent"));
            }
        }

        let applied = effect(interrupt);
        let node = if intervening {
            let before = broken_status.unwrap_or(Status::Failed);
            let node = self
                .nodes
                .transition(&target.uuid, before, Some(&[Status::InterventionWaiting]), |n| {
                    n.status_before_intervention = None;
                    n.interrupt_history.push(applied.clone());
                })?
                .applied()
                .ok_or_else(|| rejected("Intervention was decided meanwhile"))?;
            self.timers.cancel_for_node(&node.uuid)?;
            node
        } else {
            let record = AdviseRecord {
                advise: Some(Advise::Retry { wait_ms: 0 }),
                adviser: Some(InterruptType::Retry.to_string()),
                applied_at: now_millis(),
            };
            let (node, claimed) = self.update_node(&target.uuid, |n| {
                if n.advise.is_some() || n.old_retry {
                    return false;
                }
                n.advise = Some(record.clone());
                n.interrupt_history.push(applied.clone());
                true
            })?;
            if !claimed {
                return Err(rejected("Node was already advised"));
            }
            node
        };

        let attempt = self.retry_node(&node, 0)?;
        info!(node_execution_id = %node.uuid, attempt = %attempt, "Retried by operator");
        Ok(())
    }

    /// Every live leaf to `Expired`; each is then advised as usual.
    fn expire_all(&self, interrupt: &Interrupt) -> Result<(), EngineError> {
        let marked = self
            .nodes
            .mark_all_leaves_and_queued_discontinuing(&interrupt.plan_execution_id, EXPIRABLE)?;
        if marked.is_empty() {
            return Err(rejected("Nothing left to expire"));
        }
        let mut expired = 0;
        for id in &marked {
            let applied = effect(interrupt);
            if let Transition::Applied(node) =
                self.nodes
                    .transition(id, Status::Expired, Some(&[Status::Discontinuing]), |n| {
                        n.failure_info =
                            Some(FailureInfo::interrupt("Expired by operator", vec![FailureType::Timeout]));
                        n.interrupt_history.push(applied.clone());
                    })?
            {
                self.after_final(&node)?;
                expired += 1;
            }
        }
        info!(plan_execution_id = %interrupt.plan_execution_id, expired, "Leaves expired");
        Ok(())
    }

    fn custom_failure(&self, interrupt: &Interrupt, target: &NodeExecution) -> Result<(), EngineError> {
        if !FAILABLE.contains(&target.status) {
            return Err(rejected(format!("A {} node cannot be failed", target.status)));
        }
        let message = interrupt
            .metadata
            .get("message")
            .and_then(Value::as_str)
            .or(interrupt.reason.as_deref())
            .unwrap_or("Failed by operator")
            .to_string();
        let failure_types: Vec<FailureType> = match interrupt.metadata.get("failure_types") {
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|e| rejected(format!("Bad failure_types: {}", e)))?,
            None => vec![FailureType::UserMarked],
        };

        let descendants: Vec<String> = self
            .nodes
            .descendants_without_old_retries(&target.plan_execution_id, &target.uuid)?
            .into_iter()
            .map(|n| n.uuid)
            .collect();
        self.abort_nodes(&target.plan_execution_id, |n| descendants.contains(&n.uuid))?;

        let failure = FailureInfo::interrupt(message, failure_types);
        let applied = effect(interrupt);
        let outcome = self
            .nodes
            .transition(&target.uuid, Status::Failed, Some(FAILABLE), |n| {
                n.failure_info = Some(failure.clone());
                n.interrupt_history.push(applied.clone());
            })?;
        match outcome {
            Transition::Applied(node) => self.after_final(&node),
            Transition::Rejected { current } => Err(rejected(format!("Node is {}", current))),
            Transition::Missing => Err(EngineError::NodeExecutionNotFound(target.uuid.clone())),
        }
    }

    /// Manual decision for a node waiting on an intervention.
    fn decide_intervention(&self, interrupt: &Interrupt, target: &NodeExecution, success: bool) -> Result<(), EngineError> {
        if target.status != Status::InterventionWaiting {
            return Err(rejected(format!("Node is {}, not waiting for intervention", target.status)));
        }
        let to = if success { Status::Succeeded } else { Status::Failed };
        let applied = effect(interrupt);
        let node = self
            .nodes
            .transition(&target.uuid, to, Some(&[Status::InterventionWaiting]), |n| {
                n.status_before_intervention = None;
                if success {
                    n.failure_info = None;
                }
                n.interrupt_history.push(applied.clone());
            })?
            .applied()
            .ok_or_else(|| rejected("Intervention was decided meanwhile"))?;
        self.release_holds(&node)?;

        if !success {
            return self.end_branch(&node.uuid);
        }
        let next_node_id = match node.advise.as_ref().and_then(|r| r.advise.as_ref()) {
            Some(Advise::InterventionWait { next_node_id, .. }) => next_node_id.clone(),
            _ => None,
        };
        self.proceed(&node, next_node_id)
    }
}
