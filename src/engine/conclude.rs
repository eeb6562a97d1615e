//! Final statuses, advisement, and how a finished node hands control on:
//! to a sibling, to a new attempt, to its parent, or to the end of the plan.

use super::driver::child_notify_id;
use super::{BranchReport, Engine, EngineEvent, NodeSpawn};
use crate::adviser::Advise;
use crate::error::EngineError;
use crate::execution::{
    AdviseRecord, Conclusion, ErrorClass, ExecutableResponse, NodeExecution, Status, Transition,
};
use crate::timer::TimerKind;
use crate::types::{generate_uuid, now_millis};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Statuses a step result may conclude from
const CONCLUDABLE: &[Status] = &[
    Status::Running,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::ResourceWaiting,
];

impl Engine {
    /// Move a node to its final status. A node paused meanwhile keeps the
    /// conclusion until it is resumed.
    pub(crate) fn conclude_node(&self, node_execution_id: &str, conclusion: Conclusion) -> Result<(), EngineError> {
        let failure_info = conclusion.failure_info.clone();
        let outcome = self.nodes.transition(
            node_execution_id,
            conclusion.status,
            Some(CONCLUDABLE),
            |n| {
                if failure_info.is_some() {
                    n.failure_info = failure_info.clone();
                }
            },
        )?;
        match outcome {
            Transition::Applied(node) => {
                info!(
                    node_execution_id,
                    identifier = %node.identifier,
                    status = %node.status,
                    "Node concluded"
                );
                self.record_outcomes(&node, &conclusion.outcomes)?;
                self.after_final(&node)
            }
            Transition::Rejected {
                current: Status::Paused,
            } => {
                self.update_node(node_execution_id, |n| {
                    if n.status != Status::Paused || n.deferred_conclusion.is_some() {
                        return false;
                    }
                    n.deferred_conclusion = Some(conclusion.clone());
                    true
                })?;
                info!(node_execution_id, status = %conclusion.status, "Conclusion deferred while paused");
                Ok(())
            }
            Transition::Rejected { current } => {
                debug!(node_execution_id, current = %current, "Conclusion dropped");
                Ok(())
            }
            Transition::Missing => Err(EngineError::NodeExecutionNotFound(node_execution_id.to_string())),
        }
    }

    fn record_outcomes(
        &self,
        node: &NodeExecution,
        outcomes: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), EngineError> {
        for (name, value) in outcomes {
            match self.outcomes.consume(&node.context, name, value.clone(), None) {
                Ok(_) | Err(EngineError::OutputConflict { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Give back everything a final node holds: resource holds, waits, timers.
    pub(crate) fn release_holds(&self, node: &NodeExecution) -> Result<(), EngineError> {
        self.restraints.release_for_entity(&node.uuid)?;
        // A restraint node that did not get through gives its request back,
        // whichever entity the hold would have belonged to
        if !node.status.is_positive() {
            for response in &node.executable_responses {
                if let ExecutableResponse::ResourceRestraint {
                    resource_unit,
                    instance_id,
                    ..
                } = response
                {
                    self.restraints.release(resource_unit, instance_id)?;
                }
            }
        }
        self.wait_notify.cancel_for_owner(&node.uuid)?;
        self.timers.cancel_for_node(&node.uuid)?;
        Ok(())
    }

    /// Cleanup, then advisement (or straight to the branch end if an advise
    /// was already recorded).
    pub(crate) fn after_final(&self, node: &NodeExecution) -> Result<(), EngineError> {
        self.release_holds(node)?;
        if node.advise.is_some() {
            return self.end_branch(&node.uuid);
        }
        self.publish(
            &node.plan_execution_id,
            &EngineEvent::AdviseNode {
                node_execution_id: node.uuid.clone(),
            },
        )
    }

    /// Handle an `AdviseNode` event. The advise is claimed by writing it onto
    /// the record; only the claimant applies it.
    pub fn advise_node(&self, node_execution_id: &str) -> Result<(), EngineError> {
        let Some(node) = self.nodes.get(node_execution_id)? else {
            return Ok(());
        };
        if !node.status.is_final() || node.advise.is_some() || node.old_retry {
            debug!(node_execution_id, status = %node.status, "Nothing to advise");
            return Ok(());
        }

        let execution = self.plan_executions.require(&node.plan_execution_id)?;
        let never_advised = execution.is_final()
            || node.status == Status::Aborted
            || node
                .failure_info
                .as_ref()
                .map(|f| f.class == ErrorClass::Configuration)
                .unwrap_or(false);

        let decision = if never_advised {
            None
        } else {
            let plan = self.plan_for(&node)?;
            let obtainments = plan
                .node(&node.node_id)
                .map(|n| n.adviser_obtainments.clone())
                .unwrap_or_default();
            match self.advisers.advise(&node, None, &obtainments) {
                Ok(decision) => decision,
                Err(err) => {
                    error!(node_execution_id, error = %err, "Adviser failed; ending branch");
                    None
                }
            }
        };

        let record = AdviseRecord {
            advise: decision.as_ref().map(|(_, advise)| advise.clone()),
            adviser: decision.as_ref().map(|(kind, _)| kind.to_string()),
            applied_at: now_millis(),
        };
        let (node, claimed) = self.update_node(node_execution_id, |n| {
            if n.advise.is_some() {
                return false;
            }
            n.advise = Some(record.clone());
            true
        })?;
        if !claimed {
            return Ok(());
        }

        match record.advise {
            Some(advise) => {
                info!(node_execution_id, advise = advise.name(), "Applying advise");
                self.apply_advise(&node, advise)
            }
            None => self.end_branch(node_execution_id),
        }
    }

    pub(crate) fn apply_advise(&self, node: &NodeExecution, advise: Advise) -> Result<(), EngineError> {
        match advise {
            Advise::NextStep { next_node_id } => self.proceed(node, next_node_id),
            Advise::Retry { wait_ms } => self.retry_node(node, wait_ms).map(|_| ()),
            Advise::MarkSuccess { next_node_id } => {
                match self
                    .nodes
                    .transition(&node.uuid, Status::Succeeded, None, |n| n.failure_info = None)?
                {
                    Transition::Applied(marked) => {
                        self.nodes.append_progress(&marked.uuid, "Marked as success")?;
                        self.proceed(&marked, next_node_id)
                    }
                    _ => self.end_branch(&node.uuid),
                }
            }
            Advise::InterventionWait {
                timeout_ms,
                repair_action,
                ..
            } => {
                let from = node.status;
                let outcome = self.nodes.transition(
                    &node.uuid,
                    Status::InterventionWaiting,
                    Some(&[from]),
                    |n| n.status_before_intervention = Some(from),
                )?;
                if outcome.applied().is_none() {
                    return self.end_branch(&node.uuid);
                }
                self.timers.schedule(
                    TimerKind::InterventionTimeout,
                    &node.plan_execution_id,
                    &node.uuid,
                    now_millis() + timeout_ms,
                )?;
                warn!(
                    node_execution_id = %node.uuid,
                    timeout_ms,
                    repair_action = ?repair_action,
                    "Waiting for intervention"
                );
                Ok(())
            }
            Advise::EndPlan { is_abort } => {
                let status = if is_abort { Status::Aborted } else { node.status };
                self.end_plan(&node.plan_execution_id, status)
            }
        }
    }

    /// Start `next_node_id` as the next sibling, or end the branch.
    pub(crate) fn proceed(&self, node: &NodeExecution, next_node_id: Option<String>) -> Result<(), EngineError> {
        let Some(next_node_id) = next_node_id else {
            return self.end_branch(&node.uuid);
        };
        let plan = self.plan_for(node)?;
        let plan_node = match plan.node(&next_node_id) {
            Ok(plan_node) => plan_node,
            Err(err) => {
                error!(node_execution_id = %node.uuid, error = %err, "Next node missing; ending branch");
                return self.end_branch(&node.uuid);
            }
        };

        let next = self.create_node_execution(NodeSpawn {
            node: plan_node,
            parent_context: node.context.for_finish(),
            uuid: generate_uuid(),
            parent_id: node.parent_id.clone(),
            notify_id: node.notify_id.clone(),
            previous_id: Some(node.uuid.clone()),
            retry_index: 0,
            retry_ids: Vec::new(),
            strategy: None,
        })?;
        let next_id = next.uuid.clone();
        self.update_node(&node.uuid, |n| {
            n.next_id = Some(next_id.clone());
            true
        })?;
        debug!(from = %node.uuid, next = %next.uuid, node_id = %next.node_id, "Next step queued");
        self.publish_start(&next.plan_execution_id, &next.uuid)
    }

    /// Queue a new attempt of the same plan node; returns its runtime id.
    pub(crate) fn retry_node(&self, node: &NodeExecution, wait_ms: u64) -> Result<String, EngineError> {
        let plan = self.plan_for(node)?;
        let plan_node = plan.node(&node.node_id)?;
        let mut retry_ids = node.retry_ids.clone();
        retry_ids.push(node.uuid.clone());
        let strategy = node.context.current_level().and_then(|l| l.strategy.clone());

        let attempt = self.create_node_execution(NodeSpawn {
            node: plan_node,
            parent_context: node.context.for_finish(),
            uuid: generate_uuid(),
            parent_id: node.parent_id.clone(),
            notify_id: node.notify_id.clone(),
            previous_id: node.previous_id.clone(),
            retry_index: node.retry_index() + 1,
            retry_ids,
            strategy,
        })?;
        self.update_node(&node.uuid, |n| {
            if n.old_retry {
                return false;
            }
            n.old_retry = true;
            true
        })?;
        info!(
            node_execution_id = %node.uuid,
            attempt = %attempt.uuid,
            retry_index = attempt.retry_index(),
            wait_ms,
            "Retry queued"
        );

        if wait_ms > 0 {
            self.timers.schedule(
                TimerKind::StartNode,
                &attempt.plan_execution_id,
                &attempt.uuid,
                now_millis() + wait_ms,
            )?;
        } else {
            self.publish_start(&attempt.plan_execution_id, &attempt.uuid)?;
        }
        Ok(attempt.uuid)
    }

    /// The branch that ends with this node reports to whoever waits on it:
    /// the parent through its notify id, or the plan execution for the root.
    pub(crate) fn end_branch(&self, node_execution_id: &str) -> Result<(), EngineError> {
        let node = self.nodes.require(node_execution_id)?;
        match &node.notify_id {
            Some(notify_id) => {
                let report = BranchReport {
                    status: node.status,
                    node_execution_id: node.uuid.clone(),
                };
                self.wait_notify.notify(notify_id, serde_json::to_value(&report)?)?;
                debug!(node_execution_id, status = %node.status, "Branch reported");
                if let Some(parent_id) = &node.parent_id {
                    self.start_next_sibling(parent_id)?;
                }
                Ok(())
            }
            None if node.parent_id.is_none() => self.conclude_plan(&node.plan_execution_id, node.status),
            None => {
                warn!(node_execution_id, "Branch end with no one to report to");
                Ok(())
            }
        }
    }

    /// With bounded concurrency, a finished child lets the next queued one
    /// start. Only started children that have not reported count against the
    /// limit; children that ended before their turn are skipped. The release
    /// is claimed by moving `started` on the parent with a CAS.
    fn start_next_sibling(&self, parent_id: &str) -> Result<(), EngineError> {
        loop {
            let Some(parent) = self.nodes.get(parent_id)? else {
                return Ok(());
            };
            if parent.status.is_final() {
                return Ok(());
            }
            let Some(ExecutableResponse::Children {
                children,
                max_concurrency: Some(max),
                started,
            }) = parent.executable_responses.last()
            else {
                return Ok(());
            };
            let (started, max) = (*started, (*max).max(1));

            let mut reported = Vec::with_capacity(children.len());
            for slot in 0..children.len() {
                reported.push(self.wait_notify.response(&child_notify_id(parent_id, slot))?.is_some());
            }
            let running = reported[..started.min(children.len())]
                .iter()
                .filter(|done| !**done)
                .count();
            if running >= max {
                return Ok(());
            }
            let Some(next) = (started..children.len()).find(|slot| !reported[*slot]) else {
                return Ok(());
            };

            let (_, claimed) = self.update_node(parent_id, |n| {
                if n.status.is_final() {
                    return false;
                }
                match n.executable_responses.last_mut() {
                    Some(ExecutableResponse::Children { started: current, .. }) if *current == started => {
                        *current = next + 1;
                        true
                    }
                    _ => false,
                }
            })?;
            if !claimed {
                // Another report moved the window; look again
                continue;
            }
            let child = &children[next];
            debug!(parent = parent_id, child = %child.runtime_id, slot = next, "Next child released");
            self.publish_start(&parent.plan_execution_id, &child.runtime_id)?;
        }
    }

    /// Abort everything still running and close the plan execution.
    pub(crate) fn end_plan(&self, plan_execution_id: &str, status: Status) -> Result<(), EngineError> {
        let aborted = self.abort_nodes(plan_execution_id, |_| true)?;
        info!(plan_execution_id, status = %status, aborted, "Ending plan");
        self.conclude_plan(plan_execution_id, status)
    }

    /// Abort every non-final, current attempt `select` picks, deepest first.
    /// Aborted this way, nodes are not advised.
    pub(crate) fn abort_nodes<F>(&self, plan_execution_id: &str, select: F) -> Result<usize, EngineError>
    where
        F: Fn(&NodeExecution) -> bool,
    {
        let mut targets: Vec<NodeExecution> = self
            .nodes
            .for_plan_execution(plan_execution_id)?
            .into_iter()
            .filter(|n| !n.status.is_final() && !n.old_retry && select(n))
            .collect();
        targets.sort_by(|a, b| b.context.depth().cmp(&a.context.depth()));

        let mut aborted = 0;
        for target in targets {
            let record = AdviseRecord {
                advise: None,
                adviser: None,
                applied_at: now_millis(),
            };
            if let Transition::Applied(node) =
                self.nodes.transition(&target.uuid, Status::Aborted, None, |n| {
                    n.advise = Some(record.clone());
                })?
            {
                self.release_holds(&node)?;
                aborted += 1;
            }
        }
        Ok(aborted)
    }

    pub(crate) fn conclude_plan(&self, plan_execution_id: &str, status: Status) -> Result<(), EngineError> {
        let status = match status {
            Status::Skipped => Status::Succeeded,
            other => other,
        };
        if self.plan_executions.conclude(plan_execution_id, status)?.is_some() {
            self.restraints.release_for_entity(plan_execution_id)?;
        }
        Ok(())
    }

    /// Handle an `InterventionTimeout` timer: apply the repair action.
    pub(crate) fn intervention_timed_out(&self, node_execution_id: &str) -> Result<(), EngineError> {
        let Some(node) = self.nodes.get(node_execution_id)? else {
            return Ok(());
        };
        if node.status != Status::InterventionWaiting {
            return Ok(());
        }
        let Some(Advise::InterventionWait {
            repair_action,
            next_node_id,
            ..
        }) = node.advise.as_ref().and_then(|r| r.advise.clone())
        else {
            warn!(node_execution_id, "Intervention wait without its advise");
            return Ok(());
        };

        // Back to the broken status the wait started from, then repair
        let before = node.status_before_intervention.unwrap_or(Status::Failed);
        let Some(node) = self
            .nodes
            .transition(node_execution_id, before, Some(&[Status::InterventionWaiting]), |n| {
                n.status_before_intervention = None;
            })?
            .applied()
        else {
            return Ok(());
        };
        warn!(node_execution_id, repair_action = ?repair_action, "Intervention timed out");
        self.apply_advise(&node, repair_action.into_advise(next_node_id))
    }
}
