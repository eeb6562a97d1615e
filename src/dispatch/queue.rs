//! In-process task queue.
//!
//! Priority heap drained by a fixed pool of workers. Retryable runner errors
//! are re-queued after a delay; the final result of every request is notified
//! on its correlation id.

use crate::config::DispatchConfig;
use crate::dispatch::{TaskDispatcher, TaskError, TaskRequest, TaskRunner};
use crate::error::EngineError;
use crate::wait_notify::WaitNotifyService;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct TaskQueue {
    queue: Arc<Mutex<BinaryHeap<TaskRequest>>>,
    notify: Arc<Notify>,
    workers: Arc<RwLock<Vec<tokio::task::JoinHandle<()>>>>,
    config: DispatchConfig,
    runner: Arc<dyn TaskRunner>,
    wait_notify: WaitNotifyService,
    running: Arc<RwLock<bool>>,
    stats: Arc<RwLock<QueueStats>>,
    /// Correlation ids queued or in flight
    active: Arc<Mutex<HashSet<String>>>,
}

impl TaskQueue {
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        wait_notify: WaitNotifyService,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            notify: Arc::new(Notify::new()),
            workers: Arc::new(RwLock::new(Vec::new())),
            config,
            runner,
            wait_notify,
            running: Arc::new(RwLock::new(false)),
            stats: Arc::new(RwLock::new(QueueStats::default())),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn enqueue(&self, request: TaskRequest) -> Result<(), EngineError> {
        let mut queue = self.queue.lock().await;
        let mut active = self.active.lock().await;

        if active.contains(&request.correlation_id) {
            debug!(
                correlation_id = %request.correlation_id,
                "Task already queued, dropping duplicate"
            );
            return Ok(());
        }
        if queue.len() >= self.config.max_queue_size {
            warn!(
                queue_size = queue.len(),
                max_size = self.config.max_queue_size,
                "Task queue is full, rejecting request"
            );
            return Err(EngineError::DispatchError("Task queue is full".to_string()));
        }

        debug!(
            correlation_id = %request.correlation_id,
            node_execution_id = %request.node_execution_id,
            task_type = %request.descriptor.task_type,
            priority = ?request.descriptor.priority,
            queue_size = queue.len() + 1,
            "Enqueued task"
        );
        active.insert(request.correlation_id.clone());
        queue.push(request);
        self.stats.write().pending += 1;
        self.notify.notify_one();
        Ok(())
    }

    /// Start background workers
    pub fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running.write();
        if *running {
            return Ok(());
        }
        *running = true;
        drop(running);

        let mut workers = self.workers.write();
        for i in 0..self.config.workers.max(1) {
            let queue = Arc::clone(&self.queue);
            let notify = Arc::clone(&self.notify);
            let runner = Arc::clone(&self.runner);
            let wait_notify = self.wait_notify.clone();
            let config = self.config.clone();
            let running = Arc::clone(&self.running);
            let stats = Arc::clone(&self.stats);
            let active = Arc::clone(&self.active);

            let handle = tokio::spawn(async move {
                Self::worker_loop(i, queue, notify, runner, wait_notify, config, running, stats, active)
                    .await;
            });
            workers.push(handle);
        }

        info!(worker_count = workers.len(), "Started task queue workers");
        Ok(())
    }

    /// Stop background workers (graceful shutdown)
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut running = self.running.write();
        if !*running {
            return Ok(());
        }
        *running = false;
        drop(running);

        let workers = std::mem::take(&mut *self.workers.write());
        for handle in workers {
            let _ = handle.await;
        }

        info!("Stopped task queue workers");
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.read().clone()
    }

    pub async fn is_idle(&self) -> bool {
        let queue = self.queue.lock().await;
        queue.is_empty() && self.stats.read().processing == 0
    }

    /// Wait for the queue to drain
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<(), EngineError> {
        let start = Instant::now();
        loop {
            if self.is_idle().await {
                return Ok(());
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(EngineError::DispatchError(
                        "Timeout waiting for task queue to drain".to_string(),
                    ));
                }
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn worker_loop(
        worker_id: usize,
        queue: Arc<Mutex<BinaryHeap<TaskRequest>>>,
        notify: Arc<Notify>,
        runner: Arc<dyn TaskRunner>,
        wait_notify: WaitNotifyService,
        config: DispatchConfig,
        running: Arc<RwLock<bool>>,
        stats: Arc<RwLock<QueueStats>>,
        active: Arc<Mutex<HashSet<String>>>,
    ) {
        debug!(worker_id, "Task worker started");

        while *running.read() {
            let request = {
                let mut queue_guard = queue.lock().await;
                let request = queue_guard.pop();
                if request.is_some() {
                    let mut stats = stats.write();
                    stats.pending = stats.pending.saturating_sub(1);
                    stats.processing += 1;
                }
                request
            };

            let Some(mut request) = request else {
                // Periodic wake-up to notice shutdown
                tokio::select! {
                    _ = notify.notified() => continue,
                    _ = sleep(Duration::from_millis(100)) => continue,
                }
            };

            let started = Instant::now();
            let result = runner.run(&request).await;

            let should_retry = match &result {
                Ok(_) => false,
                Err(err) => request.retry_count < config.max_retry_attempts && err.is_retryable(),
            };

            // Counted as processing until re-queued or notified so a drain
            // never observes the gap
            if should_retry {
                request.retry_count += 1;
                warn!(
                    worker_id,
                    correlation_id = %request.correlation_id,
                    retry_count = request.retry_count,
                    "Task runner unavailable, retrying"
                );
                sleep(Duration::from_millis(config.retry_delay_ms)).await;
                {
                    let mut queue_guard = queue.lock().await;
                    queue_guard.push(request);
                    let mut stats_guard = stats.write();
                    stats_guard.processing = stats_guard.processing.saturating_sub(1);
                    stats_guard.pending += 1;
                }
                notify.notify_one();
                continue;
            }

            active.lock().await.remove(&request.correlation_id);
            let notified_ok = result.is_ok();
            let notified = match result {
                Ok(payload) => {
                    debug!(
                        worker_id,
                        correlation_id = %request.correlation_id,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Task completed"
                    );
                    wait_notify.notify(&request.correlation_id, payload)
                }
                Err(err) => {
                    error!(
                        worker_id,
                        correlation_id = %request.correlation_id,
                        node_execution_id = %request.node_execution_id,
                        retry_count = request.retry_count,
                        error = %err,
                        "Task failed permanently"
                    );
                    wait_notify.notify_error(&request.correlation_id, error_payload(&err))
                }
            };
            if let Err(err) = notified {
                error!(
                    worker_id,
                    correlation_id = %request.correlation_id,
                    error = %err,
                    "Failed to notify task result"
                );
            }

            let mut stats_guard = stats.write();
            stats_guard.processing = stats_guard.processing.saturating_sub(1);
            if notified_ok {
                stats_guard.completed += 1;
            } else {
                stats_guard.failed += 1;
            }
        }

        debug!(worker_id, "Task worker stopped");
    }
}

fn error_payload(err: &TaskError) -> serde_json::Value {
    json!({ "message": err.to_string() })
}

#[async_trait]
impl TaskDispatcher for TaskQueue {
    async fn dispatch(&self, request: TaskRequest) -> Result<(), EngineError> {
        self.enqueue(request).await
    }
}
