//! Event Bus
//!
//! Publish/subscribe with per-partition ordering and at-least-once delivery.
//! Subscribers on the same topic compete for envelopes; an envelope whose
//! partition already has one in flight waits until that one is acked or
//! nacked. Nacked envelopes are redelivered until the redelivery budget runs
//! out, then parked as dead letters.

pub mod memory;

pub use memory::InMemoryBus;

use crate::error::EngineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Engine work items (start, advise, timers)
pub const TOPIC_ENGINE: &str = "cadence.engine";
/// Fired wait-notify callbacks
pub const TOPIC_NOTIFY: &str = "cadence.notify";
/// Registered interrupts
pub const TOPIC_INTERRUPTS: &str = "cadence.interrupts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub topic: String,
    pub partition_key: String,
    pub payload: Value,
    /// Deliveries so far, starting at 1
    pub attempts: u32,
}

impl Envelope {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, EngineError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EngineError::BusError(format!(
                "Undecodable envelope {} on {}: {}",
                self.id, self.topic, e
            ))
        })
    }
}

pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, partition_key: &str, payload: Value) -> Result<(), EngineError>;

    fn subscribe(&self, topic: &str) -> Result<Arc<dyn Subscription>, EngineError>;
}

/// Serialize and publish in one go
pub fn publish_json<T: Serialize>(
    bus: &dyn EventBus,
    topic: &str,
    partition_key: &str,
    message: &T,
) -> Result<(), EngineError> {
    let payload = serde_json::to_value(message)
        .map_err(|e| EngineError::BusError(format!("Unserializable message for {}: {}", topic, e)))?;
    bus.publish(topic, partition_key, payload)
}

#[async_trait]
pub trait Subscription: Send + Sync {
    fn topic(&self) -> &str;

    fn try_recv(&self) -> Option<Envelope>;

    /// Wait up to `timeout` for an envelope
    async fn recv_timeout(&self, timeout: Duration) -> Option<Envelope>;

    fn ack(&self, envelope: &Envelope);

    /// Hand the envelope back for redelivery. Returns false when the
    /// redelivery budget is spent and the envelope was dead-lettered.
    fn nack(&self, envelope: Envelope) -> bool;
}
