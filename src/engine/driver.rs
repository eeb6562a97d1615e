//! Starting nodes, invoking their strategy, and resuming them when a wait
//! fires.
//!
//! Every suspension follows the same order: claim the waiting status by CAS,
//! then register the wait. A redelivered event loses the claim and does
//! nothing, so a task is dispatched at most once per link.

use super::{BranchReport, Engine, NodeSpawn};
use crate::barrier::{BarrierService, BarrierState};
use crate::dispatch::{TaskDescriptor, TaskRequest};
use crate::error::EngineError;
use crate::execution::{
    ChildRef, Conclusion, ExecutableResponse, ExecutionMode, FailureInfo, FailureType, NodeExecution,
    Status, Transition,
};
use crate::plan::{Plan, PlanNode};
use crate::restraint::{AcquireMode, AcquireRequest, HoldingScope, RestraintState};
use crate::step::{ChildSpawn, Step, StepInvocation, StepOutcome, StepResponse};
use crate::timer::TimerKind;
use crate::types::{derive_id, now_millis};
use crate::wait_notify::{NotifyCallback, NotifyEvent, ResponseMap};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const WAITING: &[Status] = &[Status::AsyncWaiting, Status::TaskWaiting, Status::ResourceWaiting];

/// How spawned children hang off their parent
enum ChildShape {
    Single,
    Many { max_concurrency: Option<usize> },
    Link {
        chain_index: usize,
        pass_through: Value,
        chain_end: bool,
    },
}

/// Id a child branch reports completion on
pub(crate) fn child_notify_id(parent_id: &str, slot: usize) -> String {
    derive_id(&[parent_id, "notify", &slot.to_string()])
}

fn child_runtime_id(parent_id: &str, slot: usize) -> String {
    derive_id(&[parent_id, "child", &slot.to_string()])
}

fn task_correlation_id(node_execution_id: &str, link: usize) -> String {
    derive_id(&[node_execution_id, "task", &link.to_string()])
}

fn restraint_instance_id(node_execution_id: &str) -> String {
    derive_id(&[node_execution_id, "restraint"])
}

impl Engine {
    /// Handle a `StartNode` event.
    pub async fn start_node(&self, node_execution_id: &str) -> Result<(), EngineError> {
        let Some(node) = self.nodes.get(node_execution_id)? else {
            warn!(node_execution_id, "Start for unknown node execution");
            return Ok(());
        };
        if node.status != Status::Queued {
            debug!(node_execution_id, status = %node.status, "Node already started");
            return Ok(());
        }

        let execution = self.plan_executions.require(&node.plan_execution_id)?;
        if execution.is_final() {
            if let Transition::Applied(skipped) =
                self.nodes
                    .transition(node_execution_id, Status::Skipped, Some(&[Status::Queued]), |_| {})?
            {
                self.release_holds(&skipped)?;
            }
            return Ok(());
        }
        if execution.paused {
            self.nodes.transition(
                node_execution_id,
                Status::Paused,
                Some(&[Status::Queued]),
                |n| n.status_before_pause = Some(Status::Queued),
            )?;
            info!(node_execution_id, "Node held by plan pause");
            return Ok(());
        }

        let node = match self
            .nodes
            .transition(node_execution_id, Status::Running, Some(&[Status::Queued]), |_| {})?
        {
            Transition::Applied(node) => node,
            _ => return Ok(()),
        };

        let plan = self.plan_for(&node)?;
        let plan_node = match plan.node(&node.node_id) {
            Ok(plan_node) => plan_node,
            Err(err) => return self.conclude_configuration_error(&node, err),
        };
        let response = match self.facilitators.facilitate(&node.context, plan_node) {
            Ok(response) => response,
            Err(err) => return self.conclude_configuration_error(&node, err),
        };

        let (node, _) = self.update_node(node_execution_id, |n| {
            n.mode = Some(response.execution_mode);
            n.pass_through = response.pass_through.clone();
            true
        })?;
        info!(
            node_execution_id,
            identifier = %node.identifier,
            mode = %response.execution_mode,
            "Node started"
        );

        if response.initial_wait_ms > 0 {
            self.timers.schedule(
                TimerKind::InvokeStrategy,
                &node.plan_execution_id,
                node_execution_id,
                now_millis() + response.initial_wait_ms,
            )?;
            return Ok(());
        }
        self.invoke_strategy(&node, &plan).await
    }

    /// Run the strategy of a `Running` node that has not acted yet.
    pub(crate) async fn invoke_strategy(&self, node: &NodeExecution, plan: &Plan) -> Result<(), EngineError> {
        match node.mode {
            Some(ExecutionMode::Barrier) => self.enter_barrier(node, plan),
            Some(ExecutionMode::ResourceRestraint) => self.enter_restraint(node, plan).await,
            Some(_) => {
                let pass_through = node.pass_through.clone();
                self.execute_step(node, plan, 0, &ResponseMap::new(), &pass_through)
                    .await
            }
            None => self.conclude_configuration_error(
                node,
                EngineError::InvalidPlan(format!("Node {} was never facilitated", node.uuid)),
            ),
        }
    }

    fn step_for<'p>(&self, node: &NodeExecution, plan: &'p Plan) -> Result<(Arc<dyn Step>, &'p PlanNode), EngineError> {
        let plan_node = plan.node(&node.node_id)?;
        let step = self.steps.get(&node.step_type.type_name)?;
        Ok((step, plan_node))
    }

    /// Invoke the step for link `chain_index` and act on what it answers.
    async fn execute_step(
        &self,
        node: &NodeExecution,
        plan: &Plan,
        chain_index: usize,
        responses: &ResponseMap,
        pass_through: &Value,
    ) -> Result<(), EngineError> {
        let (step, plan_node) = match self.step_for(node, plan) {
            Ok(found) => found,
            Err(err) => return self.conclude_configuration_error(node, err),
        };
        let mode = node.mode.unwrap_or(ExecutionMode::Sync);
        let invocation = StepInvocation {
            node_execution_id: &node.uuid,
            context: &node.context,
            step_type: &node.step_type,
            parameters: &plan_node.step_parameters,
            mode,
            pass_through,
            responses,
            chain_index,
            outputs: &self.sweeping_outputs,
        };

        let outcome = match step.execute(&invocation).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(node_execution_id = %node.uuid, error = %err, "Step failed");
                return self.conclude_failure(node, FailureInfo::from(err));
            }
        };
        if !outcome.fits(mode) {
            let err = EngineError::ModeMismatch {
                node: node.identifier.clone(),
                mode: mode.to_string(),
                outcome: outcome.kind().to_string(),
            };
            return self.conclude_configuration_error(node, err);
        }
        self.apply_outcome(node, plan, outcome).await
    }

    async fn apply_outcome(&self, node: &NodeExecution, plan: &Plan, outcome: StepOutcome) -> Result<(), EngineError> {
        match outcome {
            StepOutcome::Response(response) => self.conclude_with_response(node, response),
            StepOutcome::Async { correlation_ids } => self.wait_async(node, correlation_ids),
            StepOutcome::Task(descriptor) => self.dispatch_task(node, descriptor, None).await,
            StepOutcome::TaskLink {
                descriptor,
                pass_through,
                chain_end,
            } => {
                let link = self.chain_links(node);
                self.dispatch_task(node, descriptor, Some((link, pass_through, chain_end)))
                    .await
            }
            StepOutcome::Child { node_id } => {
                self.spawn_children(node, plan, vec![ChildSpawn::node(node_id)], ChildShape::Single)
            }
            StepOutcome::Children {
                children,
                max_concurrency,
            } => self.spawn_children(node, plan, children, ChildShape::Many { max_concurrency }),
            StepOutcome::ChildLink {
                node_id,
                pass_through,
                chain_end,
            } => {
                let chain_index = self.chain_links(node);
                self.spawn_children(
                    node,
                    plan,
                    vec![ChildSpawn::node(node_id)],
                    ChildShape::Link {
                        chain_index,
                        pass_through,
                        chain_end,
                    },
                )
            }
        }
    }

    /// Links of a chain strategy recorded so far on the stored node
    fn chain_links(&self, node: &NodeExecution) -> usize {
        node.executable_responses
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    ExecutableResponse::TaskChain { .. } | ExecutableResponse::ChildChain { .. }
                )
            })
            .count()
    }

    fn conclude_with_response(&self, node: &NodeExecution, response: StepResponse) -> Result<(), EngineError> {
        if !response.status.is_final() {
            return self.conclude_configuration_error(
                node,
                EngineError::InvalidPlan(format!(
                    "Step of {} answered with non-final status {}",
                    node.identifier, response.status
                )),
            );
        }
        self.conclude_node(&node.uuid, Conclusion::from(response))
    }

    fn wait_async(&self, node: &NodeExecution, correlation_ids: Vec<String>) -> Result<(), EngineError> {
        if correlation_ids.is_empty() {
            return self.conclude_configuration_error(
                node,
                EngineError::InvalidPlan(format!("Async step of {} gave no correlation ids", node.identifier)),
            );
        }
        if let Err(err) = self.wait_notify.check_bindable(&correlation_ids, &node.uuid) {
            return self.conclude_configuration_error(node, err);
        }
        let response = ExecutableResponse::Async {
            correlation_ids: correlation_ids.clone(),
        };
        let claimed = self.nodes.transition(
            &node.uuid,
            Status::AsyncWaiting,
            Some(&[Status::Running]),
            |n| n.executable_responses.push(response.clone()),
        )?;
        if claimed.applied().is_none() {
            debug!(node_execution_id = %node.uuid, "Async wait already claimed");
            return Ok(());
        }
        match self.wait_notify.wait_for_all(&correlation_ids, &node.uuid, resume(&node.uuid)) {
            Ok(_) => Ok(()),
            Err(err @ EngineError::CorrelationInUse { .. }) => {
                self.fail_waiting(node, FailureInfo::configuration(err.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    async fn dispatch_task(
        &self,
        node: &NodeExecution,
        descriptor: TaskDescriptor,
        chain: Option<(usize, Value, bool)>,
    ) -> Result<(), EngineError> {
        let link = chain.as_ref().map(|(index, _, _)| *index).unwrap_or(0);
        let correlation_id = task_correlation_id(&node.uuid, link);
        let task_id = format!("{}-{}", node.uuid, link);
        let task_type = descriptor.task_type.clone();
        let response = match chain {
            None => ExecutableResponse::Task {
                task_id,
                correlation_id: correlation_id.clone(),
                task_type,
            },
            Some((_, pass_through, chain_end)) => ExecutableResponse::TaskChain {
                task_id,
                correlation_id: correlation_id.clone(),
                task_type,
                chain_end,
                pass_through,
            },
        };

        // The claim is the dispatch token: whoever moves the node into
        // TaskWaiting for this link is the only one that dispatches.
        let claimed = self.nodes.transition(
            &node.uuid,
            Status::TaskWaiting,
            Some(&[Status::Running]),
            |n| n.executable_responses.push(response.clone()),
        )?;
        let Some(node) = claimed.applied() else {
            debug!(node_execution_id = %node.uuid, link, "Task dispatch already claimed");
            return Ok(());
        };
        self.wait_notify.register(&correlation_id, &node.uuid, resume(&node.uuid))?;

        let request = TaskRequest::new(
            correlation_id.clone(),
            node.uuid.clone(),
            node.plan_execution_id.clone(),
            descriptor,
        );
        match self.dispatcher.dispatch(request).await {
            Ok(()) => {
                debug!(node_execution_id = %node.uuid, correlation_id = %correlation_id, "Task dispatched");
                Ok(())
            }
            Err(err) => {
                error!(node_execution_id = %node.uuid, error = %err, "Task dispatch failed");
                self.conclude_node(
                    &node.uuid,
                    Conclusion {
                        status: Status::Failed,
                        failure_info: Some(FailureInfo::infrastructure(err.to_string())),
                        outcomes: BTreeMap::new(),
                    },
                )
            }
        }
    }

    fn spawn_children(
        &self,
        parent: &NodeExecution,
        plan: &Plan,
        spawns: Vec<ChildSpawn>,
        shape: ChildShape,
    ) -> Result<(), EngineError> {
        if spawns.is_empty() {
            return self.conclude_configuration_error(
                parent,
                EngineError::InvalidPlan(format!("{} spawned no children", parent.identifier)),
            );
        }
        let mut plan_nodes = Vec::with_capacity(spawns.len());
        for spawn in &spawns {
            match plan.node(&spawn.node_id) {
                Ok(plan_node) => plan_nodes.push(plan_node),
                Err(err) => return self.conclude_configuration_error(parent, err),
            }
        }

        let mut refs = Vec::with_capacity(spawns.len());
        let mut notify_ids = Vec::with_capacity(spawns.len());
        for (i, (spawn, plan_node)) in spawns.into_iter().zip(plan_nodes).enumerate() {
            let slot = match &shape {
                ChildShape::Link { chain_index, .. } => *chain_index,
                _ => i,
            };
            let notify_id = child_notify_id(&parent.uuid, slot);
            let child = self.create_node_execution(NodeSpawn {
                node: plan_node,
                parent_context: parent.context.clone(),
                uuid: child_runtime_id(&parent.uuid, slot),
                parent_id: Some(parent.uuid.clone()),
                notify_id: Some(notify_id.clone()),
                previous_id: None,
                retry_index: 0,
                retry_ids: Vec::new(),
                strategy: spawn.strategy,
            })?;
            refs.push(ChildRef {
                runtime_id: child.uuid,
                node_id: child.node_id,
            });
            notify_ids.push(notify_id);
        }

        let start_count = match &shape {
            ChildShape::Many {
                max_concurrency: Some(max),
            } => (*max).clamp(1, refs.len()),
            _ => refs.len(),
        };
        let response = match shape {
            ChildShape::Single => ExecutableResponse::Child { child: refs[0].clone() },
            ChildShape::Many { max_concurrency } => ExecutableResponse::Children {
                children: refs.clone(),
                max_concurrency,
                started: start_count,
            },
            ChildShape::Link {
                pass_through,
                chain_end,
                ..
            } => ExecutableResponse::ChildChain {
                child: refs[0].clone(),
                chain_end,
                pass_through,
            },
        };

        let (_, recorded) = self.update_node(&parent.uuid, |n| {
            // `started` moves as children are released, so match on the children
            let spawned = n.executable_responses.iter().any(|r| match (r, &response) {
                (
                    ExecutableResponse::Children { children: a, .. },
                    ExecutableResponse::Children { children: b, .. },
                ) => a == b,
                (r, response) => r == response,
            });
            if n.status != Status::Running || spawned {
                return false;
            }
            n.executable_responses.push(response.clone());
            true
        })?;
        if !recorded {
            debug!(node_execution_id = %parent.uuid, "Children already spawned");
            return Ok(());
        }
        self.wait_notify.wait_for_all(&notify_ids, &parent.uuid, resume(&parent.uuid))?;

        for child in &refs[..start_count] {
            self.publish_start(&parent.plan_execution_id, &child.runtime_id)?;
        }
        info!(
            node_execution_id = %parent.uuid,
            children = refs.len(),
            started = start_count,
            "Children spawned"
        );
        Ok(())
    }

    fn enter_barrier(&self, node: &NodeExecution, plan: &Plan) -> Result<(), EngineError> {
        let barrier_id = plan
            .node(&node.node_id)
            .ok()
            .and_then(|n| n.step_parameters.get("barrier_ref"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(barrier_id) = barrier_id else {
            return self.conclude_configuration_error(
                node,
                EngineError::InvalidPlan(format!("{} names no barrier", node.identifier)),
            );
        };
        let Some(participants) = plan.barriers.get(&barrier_id) else {
            return self.conclude_configuration_error(
                node,
                EngineError::InvalidPlan(format!("Barrier '{}' is not declared", barrier_id)),
            );
        };

        let correlation_id = BarrierService::correlation_id(&node.plan_execution_id, &barrier_id, &node.uuid);
        let response = ExecutableResponse::Barrier {
            barrier_id: barrier_id.clone(),
            correlation_id: correlation_id.clone(),
        };
        let claimed = self.nodes.transition(
            &node.uuid,
            Status::AsyncWaiting,
            Some(&[Status::Running]),
            |n| n.executable_responses.push(response.clone()),
        )?;
        if claimed.applied().is_none() {
            return Ok(());
        }
        self.wait_notify.register(&correlation_id, &node.uuid, resume(&node.uuid))?;

        let barrier = match self.barriers.arrive(
            &node.plan_execution_id,
            &barrier_id,
            participants,
            &node.node_id,
            &node.uuid,
        ) {
            Ok(barrier) => barrier,
            Err(err) => return self.fail_waiting(node, FailureInfo::configuration(err.to_string())),
        };
        let counted = barrier
            .arrivals
            .get(&node.node_id)
            .map(|a| a.node_execution_id == node.uuid)
            .unwrap_or(false);
        if barrier.state == BarrierState::Down && !counted {
            // A retried participant arriving after the barrier fell
            self.wait_notify.notify(&correlation_id, Value::Null)?;
        }
        Ok(())
    }

    async fn enter_restraint(&self, node: &NodeExecution, plan: &Plan) -> Result<(), EngineError> {
        let parameters = plan
            .node(&node.node_id)
            .map(|n| n.step_parameters.clone())
            .unwrap_or(Value::Null);
        let Some(resource_unit) = parameters.get("resource_unit").and_then(Value::as_str) else {
            return self.conclude_configuration_error(
                node,
                EngineError::InvalidPlan(format!("{} names no resource unit", node.identifier)),
            );
        };
        let scope: HoldingScope = match parameters.get("holding_scope") {
            Some(raw) => match serde_json::from_value(raw.clone()) {
                Ok(scope) => scope,
                Err(err) => {
                    return self.conclude_configuration_error(
                        node,
                        EngineError::InvalidPlan(format!("Bad holding_scope on {}: {}", node.identifier, err)),
                    )
                }
            },
            None => HoldingScope::default(),
        };
        let mode = match parameters.get("permits").and_then(Value::as_u64) {
            Some(permits) => AcquireMode::Bounded {
                permits: u32::try_from(permits).unwrap_or(u32::MAX),
            },
            None => AcquireMode::Exclusive,
        };
        let release_entity_id = match scope {
            HoldingScope::Node => node.uuid.clone(),
            HoldingScope::Parent => node
                .parent_id
                .clone()
                .unwrap_or_else(|| node.plan_execution_id.clone()),
            HoldingScope::Plan => node.plan_execution_id.clone(),
        };

        let instance_id = restraint_instance_id(&node.uuid);
        let instance = match self.restraints.acquire(&AcquireRequest {
            instance_id: instance_id.clone(),
            resource_unit: resource_unit.to_string(),
            release_entity_id,
            scope,
            mode,
        }) {
            Ok(instance) => instance,
            Err(err) => return self.conclude_configuration_error(node, err),
        };

        let blocked = instance.state == RestraintState::Blocked;
        let response = ExecutableResponse::ResourceRestraint {
            resource_unit: resource_unit.to_string(),
            instance_id: instance_id.clone(),
            blocked,
        };
        if blocked {
            let claimed = self.nodes.transition(
                &node.uuid,
                Status::ResourceWaiting,
                Some(&[Status::Running]),
                |n| n.executable_responses.push(response.clone()),
            )?;
            if claimed.applied().is_some() {
                self.wait_notify.register(&instance_id, &node.uuid, resume(&node.uuid))?;
                info!(
                    node_execution_id = %node.uuid,
                    resource_unit,
                    order = instance.order,
                    "Waiting for resource"
                );
            }
            return Ok(());
        }

        let (node, recorded) = self.update_node(&node.uuid, |n| {
            if n.status != Status::Running || !n.executable_responses.is_empty() {
                return false;
            }
            n.executable_responses.push(response.clone());
            true
        })?;
        if !recorded {
            return Ok(());
        }
        debug!(node_execution_id = %node.uuid, resource_unit, "Resource acquired");
        let pass_through = node.pass_through.clone();
        self.execute_step(&node, plan, 0, &ResponseMap::new(), &pass_through)
            .await
    }

    /// Handle a fired wait for a node.
    pub async fn resume_node(&self, event: NotifyEvent) -> Result<(), EngineError> {
        let NotifyCallback::ResumeNode { node_execution_id } = &event.callback;
        let Some(node) = self.nodes.get(node_execution_id)? else {
            warn!(node_execution_id = %node_execution_id, "Resume for unknown node execution");
            return Ok(());
        };

        if node.status == Status::Paused {
            let responses = event.responses.clone();
            self.update_node(node_execution_id, |n| {
                if n.status != Status::Paused {
                    return false;
                }
                n.deferred_responses
                    .get_or_insert_with(ResponseMap::new)
                    .extend(responses.clone());
                true
            })?;
            info!(node_execution_id = %node_execution_id, "Responses deferred while paused");
            return Ok(());
        }
        if node.status.is_final() || node.status == Status::Discontinuing {
            debug!(node_execution_id = %node_execution_id, status = %node.status, "Resume after node ended");
            return Ok(());
        }

        let plan = self.plan_for(&node)?;
        match node.mode {
            Some(ExecutionMode::Async) | Some(ExecutionMode::Task) => {
                let Some(node) = self.reclaim_running(&node)? else {
                    return Ok(());
                };
                self.finish_with_responses(&node, &plan, &event.responses).await
            }
            Some(ExecutionMode::TaskChain) => {
                let Some(node) = self.reclaim_running(&node)? else {
                    return Ok(());
                };
                let last = node.executable_responses.iter().rev().find_map(|r| match r {
                    ExecutableResponse::TaskChain {
                        chain_end,
                        pass_through,
                        ..
                    } => Some((*chain_end, pass_through.clone())),
                    _ => None,
                });
                match last {
                    Some((false, pass_through)) if !event.responses.values().any(|r| r.is_error) => {
                        let link = self.chain_links(&node);
                        self.execute_step(&node, &plan, link, &event.responses, &pass_through)
                            .await
                    }
                    _ => self.finish_with_responses(&node, &plan, &event.responses).await,
                }
            }
            Some(ExecutionMode::Child) | Some(ExecutionMode::Children) => {
                if node.status != Status::Running {
                    return Ok(());
                }
                let reports = branch_reports(&event.responses);
                let status = Status::aggregate(reports.iter().map(|r| r.status));
                let failure_info = self.children_failure(status, &reports)?;
                self.conclude_node(
                    &node.uuid,
                    Conclusion {
                        status,
                        failure_info,
                        outcomes: BTreeMap::new(),
                    },
                )
            }
            Some(ExecutionMode::ChildChain) => {
                if node.status != Status::Running {
                    return Ok(());
                }
                let reports = branch_reports(&event.responses);
                let status = Status::aggregate(reports.iter().map(|r| r.status));
                let last = node.executable_responses.iter().rev().find_map(|r| match r {
                    ExecutableResponse::ChildChain {
                        chain_end,
                        pass_through,
                        ..
                    } => Some((*chain_end, pass_through.clone())),
                    _ => None,
                });
                match last {
                    Some((false, pass_through)) if status.is_positive() => {
                        let link = self.chain_links(&node);
                        self.execute_step(&node, &plan, link, &event.responses, &pass_through)
                            .await
                    }
                    _ => {
                        let failure_info = self.children_failure(status, &reports)?;
                        self.conclude_node(
                            &node.uuid,
                            Conclusion {
                                status,
                                failure_info,
                                outcomes: BTreeMap::new(),
                            },
                        )
                    }
                }
            }
            Some(ExecutionMode::Barrier) | Some(ExecutionMode::ResourceRestraint) => {
                let Some(node) = self.reclaim_running(&node)? else {
                    return Ok(());
                };
                let pass_through = node.pass_through.clone();
                self.execute_step(&node, &plan, 0, &event.responses, &pass_through)
                    .await
            }
            Some(ExecutionMode::Sync) | None => {
                warn!(node_execution_id = %node.uuid, "Resume for a node that never waits");
                Ok(())
            }
        }
    }

    /// Waiting → Running; `None` if someone else already resumed it.
    fn reclaim_running(&self, node: &NodeExecution) -> Result<Option<NodeExecution>, EngineError> {
        Ok(self
            .nodes
            .transition(&node.uuid, Status::Running, Some(WAITING), |_| {})?
            .applied())
    }

    async fn finish_with_responses(
        &self,
        node: &NodeExecution,
        plan: &Plan,
        responses: &ResponseMap,
    ) -> Result<(), EngineError> {
        let (step, plan_node) = match self.step_for(node, plan) {
            Ok(found) => found,
            Err(err) => return self.conclude_configuration_error(node, err),
        };
        let pass_through = node.pass_through.clone();
        let invocation = StepInvocation {
            node_execution_id: &node.uuid,
            context: &node.context,
            step_type: &node.step_type,
            parameters: &plan_node.step_parameters,
            mode: node.mode.unwrap_or(ExecutionMode::Sync),
            pass_through: &pass_through,
            responses,
            chain_index: self.chain_links(node),
            outputs: &self.sweeping_outputs,
        };
        match step.handle_response(&invocation, responses).await {
            Ok(response) => self.conclude_with_response(node, response),
            Err(err) => self.conclude_failure(node, FailureInfo::from(err)),
        }
    }

    fn children_failure(&self, status: Status, reports: &[BranchReport]) -> Result<Option<FailureInfo>, EngineError> {
        if !status.is_broken() && status != Status::Aborted {
            return Ok(None);
        }
        let mut failure_types = Vec::new();
        let mut broken = 0;
        for report in reports.iter().filter(|r| !r.status.is_positive()) {
            broken += 1;
            if let Some(child) = self.nodes.get(&report.node_execution_id)? {
                for failure_type in child.failure_info.map(|f| f.failure_types).unwrap_or_default() {
                    if !failure_types.contains(&failure_type) {
                        failure_types.push(failure_type);
                    }
                }
            }
        }
        if failure_types.is_empty() {
            failure_types.push(FailureType::Unknown);
        }
        Ok(Some(FailureInfo::step(
            format!("{} of {} child branches did not succeed", broken, reports.len()),
            failure_types,
        )))
    }

    /// A waiting node whose wait can no longer complete
    fn fail_waiting(&self, node: &NodeExecution, failure: FailureInfo) -> Result<(), EngineError> {
        self.wait_notify.cancel_for_owner(&node.uuid)?;
        self.conclude_node(
            &node.uuid,
            Conclusion {
                status: Status::Failed,
                failure_info: Some(failure),
                outcomes: BTreeMap::new(),
            },
        )
    }

    pub(crate) fn conclude_failure(&self, node: &NodeExecution, failure: FailureInfo) -> Result<(), EngineError> {
        let status = match failure.class {
            crate::execution::ErrorClass::Configuration => Status::Errored,
            _ => Status::Failed,
        };
        self.conclude_node(
            &node.uuid,
            Conclusion {
                status,
                failure_info: Some(failure),
                outcomes: BTreeMap::new(),
            },
        )
    }

    pub(crate) fn conclude_configuration_error(&self, node: &NodeExecution, err: EngineError) -> Result<(), EngineError> {
        error!(
            node_execution_id = %node.uuid,
            identifier = %node.identifier,
            error = %err,
            "Configuration error; node errored"
        );
        self.conclude_failure(node, FailureInfo::configuration(err.to_string()))
    }

    /// Handle an `InvokeStrategy` timer.
    pub(crate) async fn invoke_after_wait(&self, node_execution_id: &str) -> Result<(), EngineError> {
        let Some(node) = self.nodes.get(node_execution_id)? else {
            return Ok(());
        };
        if node.status != Status::Running || !node.executable_responses.is_empty() {
            debug!(node_execution_id, status = %node.status, "Initial wait ended on a node that moved on");
            return Ok(());
        }
        let plan = self.plan_for(&node)?;
        self.invoke_strategy(&node, &plan).await
    }
}

fn resume(node_execution_id: &str) -> NotifyCallback {
    NotifyCallback::ResumeNode {
        node_execution_id: node_execution_id.to_string(),
    }
}

fn branch_reports(responses: &ResponseMap) -> Vec<BranchReport> {
    responses
        .values()
        .filter_map(|r| serde_json::from_value::<BranchReport>(r.payload.clone()).ok())
        .collect()
}
