//! In-process bus used by the orchestrator runtime and the tests.

use crate::bus::{Envelope, EventBus, Subscription};
use crate::error::EngineError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error};

#[derive(Default)]
struct TopicQueue {
    pending: VecDeque<Envelope>,
    in_flight: HashSet<String>,
    dead_letters: Vec<Envelope>,
}

struct Topic {
    queue: Mutex<TopicQueue>,
    notify: Notify,
}

impl Topic {
    fn new() -> Self {
        Self {
            queue: Mutex::new(TopicQueue::default()),
            notify: Notify::new(),
        }
    }
}

pub struct InMemoryBus {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    next_id: AtomicU64,
    max_redeliveries: u32,
}

impl InMemoryBus {
    pub fn new(max_redeliveries: u32) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_redeliveries,
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = self.topics.lock();
        Arc::clone(
            topics
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Topic::new())),
        )
    }

    /// Envelopes waiting on `topic`, not counting in-flight ones
    pub fn pending(&self, topic: &str) -> usize {
        self.topic(topic).queue.lock().pending.len()
    }

    pub fn dead_letters(&self, topic: &str) -> Vec<Envelope> {
        self.topic(topic).queue.lock().dead_letters.clone()
    }

    /// No pending and no in-flight envelopes on any topic
    pub fn is_idle(&self) -> bool {
        let topics: Vec<Arc<Topic>> = self.topics.lock().values().cloned().collect();
        topics.iter().all(|t| {
            let q = t.queue.lock();
            q.pending.is_empty() && q.in_flight.is_empty()
        })
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(5)
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, topic: &str, partition_key: &str, payload: Value) -> Result<(), EngineError> {
        let envelope = Envelope {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            topic: topic.to_string(),
            partition_key: partition_key.to_string(),
            payload,
            attempts: 0,
        };
        debug!(topic, partition_key, envelope_id = envelope.id, "Published");
        let topic = self.topic(topic);
        topic.queue.lock().pending.push_back(envelope);
        topic.notify.notify_one();
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<Arc<dyn Subscription>, EngineError> {
        Ok(Arc::new(MemorySubscription {
            name: topic.to_string(),
            topic: self.topic(topic),
            max_redeliveries: self.max_redeliveries,
        }))
    }
}

struct MemorySubscription {
    name: String,
    topic: Arc<Topic>,
    max_redeliveries: u32,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.name
    }

    fn try_recv(&self) -> Option<Envelope> {
        let mut queue = self.topic.queue.lock();
        let TopicQueue {
            pending, in_flight, ..
        } = &mut *queue;
        let index = pending
            .iter()
            .position(|e| !in_flight.contains(&e.partition_key))?;
        let mut envelope = pending.remove(index)?;
        envelope.attempts += 1;
        in_flight.insert(envelope.partition_key.clone());
        Some(envelope)
    }

    async fn recv_timeout(&self, timeout: Duration) -> Option<Envelope> {
        if let Some(envelope) = self.try_recv() {
            return Some(envelope);
        }
        tokio::select! {
            _ = self.topic.notify.notified() => {}
            _ = sleep(timeout) => {}
        }
        self.try_recv()
    }

    fn ack(&self, envelope: &Envelope) {
        let mut queue = self.topic.queue.lock();
        queue.in_flight.remove(&envelope.partition_key);
        let more = !queue.pending.is_empty();
        drop(queue);
        if more {
            self.topic.notify.notify_one();
        }
    }

    fn nack(&self, envelope: Envelope) -> bool {
        let mut queue = self.topic.queue.lock();
        queue.in_flight.remove(&envelope.partition_key);
        if envelope.attempts > self.max_redeliveries {
            error!(
                topic = %envelope.topic,
                envelope_id = envelope.id,
                attempts = envelope.attempts,
                "Redelivery budget spent, dead-lettering envelope"
            );
            queue.dead_letters.push(envelope);
            return false;
        }
        // Front of the queue keeps it ahead of later envelopes in its partition
        queue.pending.push_front(envelope);
        drop(queue);
        self.topic.notify.notify_one();
        true
    }
}
