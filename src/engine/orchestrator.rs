//! Orchestrator
//!
//! Consumes the engine, notify and interrupt topics and drives the timers.
//! `start` spawns background workers; `run_until_idle` drives everything on
//! the caller's task until no work is left, for tests and the CLI.

use super::{Engine, EngineEvent};
use crate::bus::{Envelope, Subscription, TOPIC_ENGINE, TOPIC_INTERRUPTS, TOPIC_NOTIFY};
use crate::error::EngineError;
use crate::interrupt::InterruptEvent;
use crate::timer::TimerKind;
use crate::types::now_millis;
use crate::wait_notify::NotifyEvent;
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Counters since the orchestrator was created
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub processed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub timers_fired: u64,
}

impl Engine {
    /// Handle a fired timer.
    pub async fn handle_timer(&self, kind: TimerKind, node_execution_id: &str) -> Result<(), EngineError> {
        match kind {
            TimerKind::StartNode => self.start_node(node_execution_id).await,
            TimerKind::InvokeStrategy => self.invoke_after_wait(node_execution_id).await,
            TimerKind::InterventionTimeout => self.intervention_timed_out(node_execution_id),
        }
    }

    /// Route one envelope to its handler.
    pub async fn handle_envelope(&self, envelope: &Envelope) -> Result<(), EngineError> {
        match envelope.topic.as_str() {
            TOPIC_INTERRUPTS => {
                let event: InterruptEvent = envelope.decode()?;
                self.process_interrupt(&event.interrupt_id)
            }
            TOPIC_NOTIFY => {
                let event: NotifyEvent = envelope.decode()?;
                self.resume_node(event).await
            }
            TOPIC_ENGINE => match envelope.decode::<EngineEvent>()? {
                EngineEvent::StartNode { node_execution_id } => self.start_node(&node_execution_id).await,
                EngineEvent::AdviseNode { node_execution_id } => self.advise_node(&node_execution_id),
                EngineEvent::TimerFired {
                    kind,
                    node_execution_id,
                } => self.handle_timer(kind, &node_execution_id).await,
            },
            other => Err(EngineError::BusError(format!("No handler for topic {}", other))),
        }
    }
}

/// What every worker shares
#[derive(Clone)]
struct Consumers {
    engine: Arc<Engine>,
    /// Polled in this order: interrupts first so a pause or abort overtakes
    /// queued work
    subscriptions: Vec<Arc<dyn Subscription>>,
    stats: Arc<RwLock<OrchestratorStats>>,
}

impl Consumers {
    /// Handle at most one envelope; returns whether there was one.
    async fn process_next(&self) -> bool {
        for subscription in &self.subscriptions {
            let Some(envelope) = subscription.try_recv() else {
                continue;
            };
            match self.engine.handle_envelope(&envelope).await {
                Ok(()) => {
                    subscription.ack(&envelope);
                    self.stats.write().processed += 1;
                }
                Err(err) => {
                    warn!(
                        topic = %envelope.topic,
                        envelope_id = envelope.id,
                        attempts = envelope.attempts,
                        error = %err,
                        "Handler failed; handing envelope back"
                    );
                    let mut stats = self.stats.write();
                    stats.failed += 1;
                    if !subscription.nack(envelope) {
                        stats.dead_lettered += 1;
                        error!(error = %err, "Envelope dead-lettered");
                    }
                }
            }
            return true;
        }
        false
    }

    /// Claim due timers and queue their events.
    fn fire_timers(&self) -> Result<usize, EngineError> {
        let due = self.engine.timers().fire_due(now_millis())?;
        for timer in &due {
            self.engine.publish(
                &timer.plan_execution_id,
                &EngineEvent::TimerFired {
                    kind: timer.kind,
                    node_execution_id: timer.node_execution_id.clone(),
                },
            )?;
        }
        if !due.is_empty() {
            self.stats.write().timers_fired += due.len() as u64;
            debug!(fired = due.len(), "Timers fired");
        }
        Ok(due.len())
    }
}

pub struct Orchestrator {
    consumers: Consumers,
    running: Arc<RwLock<bool>>,
    workers: RwLock<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(engine: Arc<Engine>) -> Result<Self, EngineError> {
        let bus = Arc::clone(engine.bus());
        let subscriptions = vec![
            bus.subscribe(TOPIC_INTERRUPTS)?,
            bus.subscribe(TOPIC_NOTIFY)?,
            bus.subscribe(TOPIC_ENGINE)?,
        ];
        Ok(Self {
            consumers: Consumers {
                engine,
                subscriptions,
                stats: Arc::new(RwLock::new(OrchestratorStats::default())),
            },
            running: Arc::new(RwLock::new(false)),
            workers: RwLock::new(Vec::new()),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.consumers.engine
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.consumers.stats.read().clone()
    }

    /// Handle at most one pending envelope.
    pub async fn process_next(&self) -> bool {
        self.consumers.process_next().await
    }

    pub fn fire_timers(&self) -> Result<usize, EngineError> {
        self.consumers.fire_timers()
    }

    /// Drive the engine on this task until nothing is left to do: no
    /// envelopes, no running tasks, and no timer due before `timeout` runs
    /// out. Returns false if the timeout hit first.
    pub async fn run_until_idle(&self, timeout: Duration) -> Result<bool, EngineError> {
        let engine = &self.consumers.engine;
        if let Some(queue) = engine.task_queue() {
            queue.start()?;
        }
        let started = Instant::now();
        let horizon = now_millis() + timeout.as_millis() as u64;

        loop {
            if started.elapsed() >= timeout {
                warn!(timeout_ms = timeout.as_millis() as u64, "Engine still busy at timeout");
                return Ok(false);
            }
            self.fire_timers()?;
            if self.process_next().await {
                continue;
            }
            if let Some(queue) = engine.task_queue() {
                if !queue.is_idle().await {
                    sleep(Duration::from_millis(2)).await;
                    continue;
                }
            }
            match engine.timers().next_deadline()? {
                Some(deadline) if deadline <= horizon => {
                    let wait = deadline.saturating_sub(now_millis()).clamp(1, 20);
                    sleep(Duration::from_millis(wait)).await;
                }
                _ => return Ok(true),
            }
        }
    }

    /// Spawn the engine workers, the timer tick and the buffered-notify sweep.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running.write();
        if *running {
            return Ok(());
        }
        *running = true;
        drop(running);

        let engine = &self.consumers.engine;
        if let Some(queue) = engine.task_queue() {
            queue.start()?;
        }
        let settings = engine.config().engine.clone();
        let sweep_every = Duration::from_millis(engine.config().wait_notify.sweep_interval_ms.max(1));

        let mut workers = self.workers.write();
        for i in 0..settings.workers.max(1) {
            let consumers = self.consumers.clone();
            let running = Arc::clone(&self.running);
            let poll = Duration::from_millis(settings.poll_interval_ms.max(1));
            workers.push(tokio::spawn(async move {
                debug!(worker_id = i, "Engine worker started");
                while *running.read() {
                    if !consumers.process_next().await {
                        sleep(poll).await;
                    }
                }
                debug!(worker_id = i, "Engine worker stopped");
            }));
        }

        let consumers = self.consumers.clone();
        let running = Arc::clone(&self.running);
        let tick = Duration::from_millis(settings.timer_tick_ms.max(1));
        workers.push(tokio::spawn(async move {
            let mut last_sweep = Instant::now();
            while *running.read() {
                if let Err(err) = consumers.fire_timers() {
                    error!(error = %err, "Timer tick failed");
                }
                if last_sweep.elapsed() >= sweep_every {
                    last_sweep = Instant::now();
                    match consumers.engine.wait_notify().sweep_buffered(now_millis()) {
                        Ok(0) => {}
                        Ok(dropped) => info!(dropped, "Swept stale notifies"),
                        Err(err) => error!(error = %err, "Notify sweep failed"),
                    }
                }
                sleep(tick).await;
            }
        }));

        info!(worker_count = settings.workers.max(1), "Orchestrator started");
        Ok(())
    }

    /// Stop background workers and the task queue (graceful shutdown).
    pub async fn stop(&self) -> Result<(), EngineError> {
        let was_running = std::mem::replace(&mut *self.running.write(), false);
        let workers = std::mem::take(&mut *self.workers.write());
        for joined in join_all(workers).await {
            if let Err(err) = joined {
                warn!(error = %err, "Engine worker ended abnormally");
            }
        }
        if let Some(queue) = self.consumers.engine.task_queue() {
            queue.stop().await?;
        }
        if was_running {
            info!("Orchestrator stopped");
        }
        Ok(())
    }
}
