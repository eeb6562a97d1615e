//! Orchestration Engine
//!
//! Walks a plan one node execution at a time. Every step of the walk is a
//! handler for one event: start a node, resume it when a wait fires, advise
//! it once it is final, apply a timer or an interrupt. Handlers read and
//! write only through the stores and publish follow-up work on the bus, so
//! any worker can pick up any event and a redelivered event finds the work
//! already claimed.
//!
//! - [`driver`]: start, strategy invocation, resume after waits
//! - [`conclude`]: final statuses, advisement, branch and plan ends
//! - [`interrupts`]: operator interrupts
//! - [`orchestrator`]: worker loops over the bus topics and timers

pub mod conclude;
pub mod driver;
pub mod interrupts;
pub mod orchestrator;
pub mod plan_execution;

pub use orchestrator::Orchestrator;
pub use plan_execution::{PlanExecution, PlanExecutionStore};

use crate::adviser::AdviserRegistry;
use crate::barrier::BarrierService;
use crate::bus::{publish_json, EventBus, InMemoryBus, TOPIC_ENGINE};
use crate::config::CadenceConfig;
use crate::context::{ExecutionContext, StrategyMetadata};
use crate::dispatch::{EchoRunner, TaskDispatcher, TaskQueue, TaskRunner};
use crate::error::{EngineError, StorageError};
use crate::execution::{NodeExecution, NodeExecutionStore, Status};
use crate::facilitator::FacilitatorRegistry;
use crate::interrupt::{Interrupt, InterruptManager, InterruptRequest, InterruptStore};
use crate::outputs::OutputResolver;
use crate::plan::{Plan, PlanNode, PlanRepository};
use crate::restraint::RestraintGate;
use crate::step::StepRegistry;
use crate::store::{Storage, Update};
use crate::timer::{TimerKind, TimerService};
use crate::types::{generate_uuid, now_millis};
use crate::wait_notify::{NotifyOutcome, WaitNotifyService};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Work items on the engine topic, partitioned by plan execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    StartNode { node_execution_id: String },
    AdviseNode { node_execution_id: String },
    TimerFired {
        kind: TimerKind,
        node_execution_id: String,
    },
}

/// Payload a finished branch notifies its parent with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchReport {
    pub status: Status,
    pub node_execution_id: String,
}

/// Everything needed to persist one new attempt
pub(crate) struct NodeSpawn<'a> {
    pub node: &'a PlanNode,
    /// Context the new level is pushed onto
    pub parent_context: ExecutionContext,
    pub uuid: String,
    pub parent_id: Option<String>,
    pub notify_id: Option<String>,
    pub previous_id: Option<String>,
    pub retry_index: u32,
    pub retry_ids: Vec<String>,
    pub strategy: Option<StrategyMetadata>,
}

enum Dispatch {
    Dispatcher(Arc<dyn TaskDispatcher>),
    Runner(Arc<dyn TaskRunner>),
}

pub struct EngineBuilder {
    storage: Storage,
    config: CadenceConfig,
    bus: Option<Arc<dyn EventBus>>,
    dispatch: Dispatch,
    steps: StepRegistry,
    facilitators: FacilitatorRegistry,
    advisers: Option<AdviserRegistry>,
}

impl EngineBuilder {
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Hand tasks to an external dispatcher; results arrive through `notify`.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatch = Dispatch::Dispatcher(dispatcher);
        self
    }

    /// Run tasks in-process on the task queue with this runner.
    pub fn with_task_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.dispatch = Dispatch::Runner(runner);
        self
    }

    pub fn with_steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_facilitators(mut self, facilitators: FacilitatorRegistry) -> Self {
        self.facilitators = facilitators;
        self
    }

    pub fn with_advisers(mut self, advisers: AdviserRegistry) -> Self {
        self.advisers = Some(advisers);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        let storage = self.storage;
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(InMemoryBus::new(config.engine.max_redeliveries)));

        let wait_notify = WaitNotifyService::open(&storage, Arc::clone(&bus), config.wait_notify.clone())?;
        let capacities: HashMap<String, u32> = config
            .restraints
            .iter()
            .map(|(name, resource)| (name.clone(), resource.capacity))
            .collect();
        let restraints = RestraintGate::open(&storage, capacities, wait_notify.clone())?;
        let barriers = BarrierService::open(&storage, wait_notify.clone())?;

        let (dispatcher, task_queue): (Arc<dyn TaskDispatcher>, Option<Arc<TaskQueue>>) = match self.dispatch {
            Dispatch::Dispatcher(dispatcher) => (dispatcher, None),
            Dispatch::Runner(runner) => {
                let queue = Arc::new(TaskQueue::new(runner, wait_notify.clone(), config.dispatch.clone()));
                (Arc::clone(&queue) as Arc<dyn TaskDispatcher>, Some(queue))
            }
        };

        let advisers = self
            .advisers
            .unwrap_or_else(|| AdviserRegistry::with_defaults(&config.intervention));

        Ok(Engine {
            plans: PlanRepository::open(&storage)?,
            plan_executions: PlanExecutionStore::open(&storage)?,
            nodes: NodeExecutionStore::open(&storage)?,
            interrupts: InterruptManager::new(InterruptStore::open(&storage)?, Arc::clone(&bus)),
            timers: TimerService::open(&storage)?,
            sweeping_outputs: OutputResolver::sweeping_outputs(&storage)?,
            outcomes: OutputResolver::outcomes(&storage)?,
            facilitators: self.facilitators,
            advisers,
            steps: self.steps,
            wait_notify,
            restraints,
            barriers,
            dispatcher,
            task_queue,
            bus,
            storage,
            config,
        })
    }
}

pub struct Engine {
    plans: PlanRepository,
    plan_executions: PlanExecutionStore,
    nodes: NodeExecutionStore,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    steps: StepRegistry,
    wait_notify: WaitNotifyService,
    interrupts: InterruptManager,
    timers: TimerService,
    restraints: RestraintGate,
    barriers: BarrierService,
    sweeping_outputs: OutputResolver,
    outcomes: OutputResolver,
    dispatcher: Arc<dyn TaskDispatcher>,
    task_queue: Option<Arc<TaskQueue>>,
    bus: Arc<dyn EventBus>,
    storage: Storage,
    config: CadenceConfig,
}

impl Engine {
    /// Builder with built-in steps, default facilitators and advisers, an
    /// in-memory bus and an in-process task queue running [`EchoRunner`].
    pub fn builder(storage: Storage, config: CadenceConfig) -> EngineBuilder {
        EngineBuilder {
            storage,
            config,
            bus: None,
            dispatch: Dispatch::Runner(Arc::new(EchoRunner)),
            steps: StepRegistry::with_builtins(),
            facilitators: FacilitatorRegistry::with_defaults(),
            advisers: None,
        }
    }

    pub fn plans(&self) -> &PlanRepository {
        &self.plans
    }

    pub fn plan_executions(&self) -> &PlanExecutionStore {
        &self.plan_executions
    }

    pub fn nodes(&self) -> &NodeExecutionStore {
        &self.nodes
    }

    pub fn wait_notify(&self) -> &WaitNotifyService {
        &self.wait_notify
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    pub fn restraints(&self) -> &RestraintGate {
        &self.restraints
    }

    pub fn barriers(&self) -> &BarrierService {
        &self.barriers
    }

    pub fn sweeping_outputs(&self) -> &OutputResolver {
        &self.sweeping_outputs
    }

    pub fn outcomes(&self) -> &OutputResolver {
        &self.outcomes
    }

    pub fn interrupts(&self) -> &InterruptManager {
        &self.interrupts
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn task_queue(&self) -> Option<&Arc<TaskQueue>> {
        self.task_queue.as_ref()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    /// Structural checks plus every facilitator, adviser and step type the
    /// plan names must be registered.
    pub fn validate_plan(&self, plan: &Plan) -> Result<(), EngineError> {
        plan.validate()?;
        self.facilitators.validate_plan(plan)?;
        self.advisers.validate_plan(plan)?;
        self.steps.validate_plan(plan)?;
        Ok(())
    }

    /// Persist the plan, create the execution and queue its start node.
    pub fn start_plan_execution(
        &self,
        plan: Plan,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Result<PlanExecution, EngineError> {
        self.validate_plan(&plan)?;
        let plan = self.plans.save(plan)?;
        let execution = PlanExecution::new(generate_uuid(), plan.uuid.clone(), setup_abstractions);
        self.plan_executions.create(&execution)?;

        let start = plan.start_node()?;
        let context = ExecutionContext::new(
            execution.uuid.clone(),
            plan.uuid.clone(),
            execution.setup_abstractions.clone(),
        );
        let root = self.create_node_execution(NodeSpawn {
            node: start,
            parent_context: context,
            uuid: generate_uuid(),
            parent_id: None,
            notify_id: None,
            previous_id: None,
            retry_index: 0,
            retry_ids: Vec::new(),
            strategy: None,
        })?;

        info!(
            plan_execution_id = %execution.uuid,
            plan_id = %plan.uuid,
            root = %root.uuid,
            "Plan execution started"
        );
        self.publish_start(&root.plan_execution_id, &root.uuid)?;
        Ok(execution)
    }

    pub fn register_interrupt(&self, request: InterruptRequest) -> Result<Interrupt, EngineError> {
        self.interrupts.register(request)
    }

    /// Deliver a result for a correlation id, as an external worker would.
    pub fn notify(&self, correlation_id: &str, payload: Value, is_error: bool) -> Result<NotifyOutcome, EngineError> {
        if is_error {
            self.wait_notify.notify_error(correlation_id, payload)
        } else {
            self.wait_notify.notify(correlation_id, payload)
        }
    }

    /// Persist a new `Queued` attempt. Creating an id that already exists
    /// returns the stored record so redelivered spawns stay harmless.
    pub(crate) fn create_node_execution(&self, spawn: NodeSpawn<'_>) -> Result<NodeExecution, EngineError> {
        let mut level = spawn.node.level(&spawn.uuid, spawn.retry_index, now_millis());
        let mut identifier = spawn.node.identifier.clone();
        if let Some(strategy) = spawn.strategy {
            level = level.with_strategy(strategy);
            identifier.push_str(&crate::context::strategy_postfix(&level, false));
            level.identifier = identifier.clone();
        }
        let context = spawn.parent_context.for_child(level);

        let mut record = NodeExecution::queued(
            spawn.uuid.clone(),
            spawn.node.uuid.clone(),
            identifier,
            spawn.node.display_name(),
            spawn.node.step_type.clone(),
            context,
        )
        .with_parent(spawn.parent_id)
        .with_notify_id(spawn.notify_id)
        .with_previous(spawn.previous_id);
        record.retry_ids = spawn.retry_ids;

        match self.nodes.create(&record) {
            Ok(()) => {
                debug!(
                    node_execution_id = %record.uuid,
                    node_id = %record.node_id,
                    retry_index = record.retry_index(),
                    "Node execution created"
                );
                Ok(record)
            }
            Err(StorageError::AlreadyExists { .. }) => Ok(self.nodes.require(&spawn.uuid)?),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn publish(&self, plan_execution_id: &str, event: &EngineEvent) -> Result<(), EngineError> {
        publish_json(self.bus.as_ref(), TOPIC_ENGINE, plan_execution_id, event)
    }

    pub(crate) fn publish_start(&self, plan_execution_id: &str, node_execution_id: &str) -> Result<(), EngineError> {
        self.publish(
            plan_execution_id,
            &EngineEvent::StartNode {
                node_execution_id: node_execution_id.to_string(),
            },
        )
    }

    /// Apply `mutate` and return the stored record either way.
    pub(crate) fn update_node<F>(&self, id: &str, mutate: F) -> Result<(NodeExecution, bool), EngineError>
    where
        F: FnMut(&mut NodeExecution) -> bool,
    {
        match self.nodes.update(id, mutate)? {
            Update::Applied(node) => Ok((node, true)),
            Update::Unchanged(node) => Ok((node, false)),
            Update::Missing => Err(EngineError::NodeExecutionNotFound(id.to_string())),
        }
    }

    pub(crate) fn plan_for(&self, node: &NodeExecution) -> Result<Arc<Plan>, EngineError> {
        self.plans.get(&node.context.plan_id)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("steps", &self.steps)
            .field("facilitators", &self.facilitators)
            .field("advisers", &self.advisers)
            .finish_non_exhaustive()
    }
}
