//! Wait-Notify Correlator
//!
//! A durable promise registry. A waiter registers one or more correlation ids
//! together with a callback; whoever finishes the work notifies each id with a
//! result. When every id of a wait has a response the wait fires exactly once
//! and a [`NotifyEvent`] is published on the notify topic.
//!
//! Responses are write-once per correlation id, so duplicate notifies are
//! dropped. A notify that arrives before its registration is kept and handed
//! over when the registration lands; if it never does, `sweep_buffered`
//! drops it after the configured grace period.
//!
//! An id belongs to one live wait at a time. Once that wait has fired or been
//! cancelled, a later registration (a retried attempt reusing its ids) takes
//! the id over; the response left behind is stale and only a fresh notify
//! fires the new wait.

use crate::bus::{publish_json, EventBus, TOPIC_NOTIFY};
use crate::config::WaitNotifyConfig;
use crate::error::EngineError;
use crate::store::{Collection, KeyIndex, Storage};
use crate::types::{derive_id, now_millis, CorrelationId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TREE_WAITS: &str = "wait_instances";
const TREE_WAIT_INDEX: &str = "wait_index";
const TREE_RESPONSES: &str = "notify_responses";
const TREE_BUFFERED: &str = "notify_buffered";
const TREE_BY_OWNER: &str = "wait_by_owner";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    pub payload: Value,
    #[serde(default)]
    pub is_error: bool,
    pub notified_at: u64,
    /// Wait this response was handed to
    #[serde(default)]
    pub consumed_by: Option<String>,
}

impl ResponseData {
    pub fn success(payload: Value) -> Self {
        Self {
            payload,
            is_error: false,
            notified_at: now_millis(),
            consumed_by: None,
        }
    }

    pub fn error(payload: Value) -> Self {
        Self {
            payload,
            is_error: true,
            notified_at: now_millis(),
            consumed_by: None,
        }
    }

    /// Whether this response can still be handed to `wait_id`
    fn available_to(&self, wait_id: &str) -> bool {
        self.consumed_by.as_deref().map_or(true, |w| w == wait_id)
    }
}

/// Responses of a fired wait keyed by correlation id
pub type ResponseMap = BTreeMap<CorrelationId, ResponseData>;

/// What to do when a wait fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifyCallback {
    ResumeNode { node_execution_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitState {
    Waiting,
    Fired,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitInstance {
    pub uuid: String,
    pub correlation_ids: Vec<CorrelationId>,
    pub callback: NotifyCallback,
    /// Entity the wait belongs to, for cancellation
    pub owner: String,
    pub state: WaitState,
    pub created_at: u64,
    #[serde(default)]
    pub fired_at: Option<u64>,
}

/// Published on the notify topic when a wait fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyEvent {
    pub wait_id: String,
    pub callback: NotifyCallback,
    pub responses: ResponseMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    wait_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BufferedNotify {
    received_at: u64,
}

/// Outcome of a notify call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Response stored and handed to a registered wait
    Delivered,
    /// No registration yet; kept for the grace period
    Buffered,
    /// A response for this id already exists; this one was dropped
    Duplicate,
}

#[derive(Clone)]
pub struct WaitNotifyService {
    waits: Collection<WaitInstance>,
    index: Collection<IndexEntry>,
    responses: Collection<ResponseData>,
    buffered: Collection<BufferedNotify>,
    by_owner: KeyIndex,
    bus: Arc<dyn EventBus>,
    config: WaitNotifyConfig,
}

impl WaitNotifyService {
    pub fn open(
        storage: &Storage,
        bus: Arc<dyn EventBus>,
        config: WaitNotifyConfig,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            waits: Collection::open(storage, TREE_WAITS)?,
            index: Collection::open(storage, TREE_WAIT_INDEX)?,
            responses: Collection::open(storage, TREE_RESPONSES)?,
            buffered: Collection::open(storage, TREE_BUFFERED)?,
            by_owner: KeyIndex::open(storage, TREE_BY_OWNER)?,
            bus,
            config,
        })
    }

    /// Single-id form of [`wait_for_all`](Self::wait_for_all)
    pub fn register(
        &self,
        correlation_id: &str,
        owner: &str,
        callback: NotifyCallback,
    ) -> Result<String, EngineError> {
        self.wait_for_all(&[correlation_id.to_string()], owner, callback)
    }

    /// Register one wait over every id; fires once when all have responses.
    ///
    /// Idempotent: the wait id is derived from the owner and ids. An id still
    /// held by another live wait is refused with
    /// [`EngineError::CorrelationInUse`] and nothing is registered.
    pub fn wait_for_all(
        &self,
        correlation_ids: &[CorrelationId],
        owner: &str,
        callback: NotifyCallback,
    ) -> Result<String, EngineError> {
        if correlation_ids.is_empty() {
            return Err(EngineError::ConfigError(format!(
                "Wait for '{}' registered without correlation ids",
                owner
            )));
        }
        let wait_id = Self::wait_id(correlation_ids, owner);
        self.check_bindable(correlation_ids, owner)?;

        let instance = WaitInstance {
            uuid: wait_id.clone(),
            correlation_ids: correlation_ids.to_vec(),
            callback,
            owner: owner.to_string(),
            state: WaitState::Waiting,
            created_at: now_millis(),
            fired_at: None,
        };
        if !self.waits.insert_new(&wait_id, &instance)? {
            debug!(wait_id = %wait_id, owner, "Wait already registered");
        }
        self.by_owner.add(owner, &wait_id)?;

        for correlation_id in correlation_ids {
            if let Err(err) = self.bind(correlation_id, &wait_id) {
                // Lost a race for the id; this wait must never fire
                self.waits.update(&wait_id, |w| {
                    if w.state != WaitState::Waiting {
                        return false;
                    }
                    w.state = WaitState::Cancelled;
                    true
                })?;
                return Err(err);
            }
        }
        debug!(
            wait_id = %wait_id,
            owner,
            correlation_ids = correlation_ids.len(),
            "Wait registered"
        );

        // A notify may already be here
        self.try_fire(&wait_id)?;
        Ok(wait_id)
    }

    fn wait_id(correlation_ids: &[CorrelationId], owner: &str) -> String {
        let mut parts: Vec<&str> = vec!["wait", owner];
        parts.extend(correlation_ids.iter().map(String::as_str));
        derive_id(&parts)
    }

    /// Fails when any id is held by a live wait other than the one `owner`
    /// would register for these ids.
    pub fn check_bindable(
        &self,
        correlation_ids: &[CorrelationId],
        owner: &str,
    ) -> Result<(), EngineError> {
        let wait_id = Self::wait_id(correlation_ids, owner);
        for correlation_id in correlation_ids {
            if let Some(entry) = self.index.get(correlation_id)? {
                if entry.wait_id != wait_id && self.is_live(&entry.wait_id)? {
                    return Err(EngineError::CorrelationInUse {
                        correlation_id: correlation_id.clone(),
                        wait_id: entry.wait_id,
                    });
                }
            }
        }
        Ok(())
    }

    fn is_live(&self, wait_id: &str) -> Result<bool, EngineError> {
        Ok(self
            .waits
            .get(wait_id)?
            .map_or(false, |w| w.state == WaitState::Waiting))
    }

    /// Point `correlation_id` at `wait_id`, taking it over from a wait that
    /// has fired or been cancelled.
    fn bind(&self, correlation_id: &str, wait_id: &str) -> Result<(), EngineError> {
        let entry = IndexEntry {
            wait_id: wait_id.to_string(),
        };
        if self.index.insert_new(correlation_id, &entry)? {
            return Ok(());
        }
        let previous = self.index.require(correlation_id)?.wait_id;
        if previous == wait_id {
            return Ok(());
        }
        if self.is_live(&previous)? {
            warn!(
                correlation_id,
                wait_id,
                bound_to = %previous,
                "Correlation id already bound to a live wait"
            );
            return Err(EngineError::CorrelationInUse {
                correlation_id: correlation_id.to_string(),
                wait_id: previous,
            });
        }

        // Whatever the previous wait left behind is not for this one
        self.responses.update(correlation_id, |r| {
            if r.consumed_by.is_some() {
                return false;
            }
            r.consumed_by = Some(previous.clone());
            true
        })?;
        let rebound = self.index.update(correlation_id, |e| {
            if e.wait_id != previous {
                return false;
            }
            e.wait_id = wait_id.to_string();
            true
        })?;
        if !rebound.is_applied() {
            let current = self.index.require(correlation_id)?.wait_id;
            if current != wait_id {
                return Err(EngineError::CorrelationInUse {
                    correlation_id: correlation_id.to_string(),
                    wait_id: current,
                });
            }
        }
        debug!(correlation_id, wait_id, previous = %previous, "Correlation id rebound");
        Ok(())
    }

    pub fn notify(&self, correlation_id: &str, payload: Value) -> Result<NotifyOutcome, EngineError> {
        self.deliver(correlation_id, ResponseData::success(payload))
    }

    pub fn notify_error(
        &self,
        correlation_id: &str,
        payload: Value,
    ) -> Result<NotifyOutcome, EngineError> {
        self.deliver(correlation_id, ResponseData::error(payload))
    }

    pub fn deliver(
        &self,
        correlation_id: &str,
        response: ResponseData,
    ) -> Result<NotifyOutcome, EngineError> {
        if !self.responses.insert_new(correlation_id, &response)? && !self.replace_stale(correlation_id, &response)? {
            debug!(correlation_id, "Duplicate notify dropped");
            return Ok(NotifyOutcome::Duplicate);
        }
        match self.index.get(correlation_id)? {
            Some(entry) => {
                self.try_fire(&entry.wait_id)?;
                Ok(NotifyOutcome::Delivered)
            }
            None => {
                self.buffered.put(
                    correlation_id,
                    &BufferedNotify {
                        received_at: response.notified_at,
                    },
                )?;
                // Registration may have landed between the two reads
                if let Some(entry) = self.index.get(correlation_id)? {
                    self.buffered.remove(correlation_id)?;
                    self.try_fire(&entry.wait_id)?;
                    return Ok(NotifyOutcome::Delivered);
                }
                info!(correlation_id, "Notify buffered until registration");
                Ok(NotifyOutcome::Buffered)
            }
        }
    }

    /// Swap in a fresh response when the stored one was consumed by a wait
    /// the id is no longer bound to.
    fn replace_stale(&self, correlation_id: &str, response: &ResponseData) -> Result<bool, EngineError> {
        let bound = self.index.get(correlation_id)?.map(|e| e.wait_id);
        let replaced = self.responses.update(correlation_id, |r| {
            let stale = match (&r.consumed_by, &bound) {
                (Some(consumer), Some(bound)) => consumer != bound,
                _ => false,
            };
            if !stale {
                return false;
            }
            *r = response.clone();
            true
        })?;
        Ok(replaced.is_applied())
    }

    /// Fire the wait if every id has a response; the CAS on the state makes
    /// sure only one caller publishes.
    fn try_fire(&self, wait_id: &str) -> Result<bool, EngineError> {
        let Some(instance) = self.waits.get(wait_id)? else {
            return Ok(false);
        };
        if instance.state != WaitState::Waiting {
            return Ok(false);
        }
        let mut responses = ResponseMap::new();
        for correlation_id in &instance.correlation_ids {
            match self.responses.get(correlation_id)? {
                Some(response) if response.available_to(wait_id) => {
                    responses.insert(correlation_id.clone(), response);
                }
                _ => return Ok(false),
            }
        }

        let claimed = self.waits.update(wait_id, |w| {
            if w.state != WaitState::Waiting {
                return false;
            }
            w.state = WaitState::Fired;
            w.fired_at = Some(now_millis());
            true
        })?;
        if !claimed.is_applied() {
            return Ok(false);
        }

        let event = NotifyEvent {
            wait_id: wait_id.to_string(),
            callback: instance.callback.clone(),
            responses,
        };
        let partition = match &instance.callback {
            NotifyCallback::ResumeNode { node_execution_id } => node_execution_id.clone(),
        };
        if let Err(err) = publish_json(self.bus.as_ref(), TOPIC_NOTIFY, &partition, &event) {
            // Give the next notify or registration another chance to fire
            self.waits.update(wait_id, |w| {
                if w.state != WaitState::Fired {
                    return false;
                }
                w.state = WaitState::Waiting;
                w.fired_at = None;
                true
            })?;
            return Err(err);
        }
        for correlation_id in &instance.correlation_ids {
            self.responses.update(correlation_id, |r| {
                if r.consumed_by.is_some() {
                    return false;
                }
                r.consumed_by = Some(wait_id.to_string());
                true
            })?;
            self.buffered.remove(correlation_id)?;
        }
        info!(wait_id, owner = %instance.owner, "Wait fired");
        Ok(true)
    }

    /// Cancel every outstanding wait of `owner`; returns how many moved.
    pub fn cancel_for_owner(&self, owner: &str) -> Result<usize, EngineError> {
        let mut cancelled = 0;
        for wait_id in self.by_owner.members(owner)? {
            let outcome = self.waits.update(&wait_id, |w| {
                if w.state != WaitState::Waiting {
                    return false;
                }
                w.state = WaitState::Cancelled;
                true
            })?;
            if outcome.is_applied() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(owner, cancelled, "Waits cancelled");
        }
        Ok(cancelled)
    }

    /// Drop buffered notifies older than the grace period that still have
    /// no registration.
    pub fn sweep_buffered(&self, now: u64) -> Result<usize, EngineError> {
        let mut dropped = 0;
        for (correlation_id, buffered) in self.buffered.scan_prefix("")? {
            let age = now.saturating_sub(buffered.received_at);
            if age < self.config.notify_grace_period_ms {
                continue;
            }
            if self.index.get(&correlation_id)?.is_some() {
                self.buffered.remove(&correlation_id)?;
                continue;
            }
            self.buffered.remove(&correlation_id)?;
            self.responses.remove(&correlation_id)?;
            warn!(
                correlation_id = %correlation_id,
                age_ms = age,
                "Dropping notify that was never registered"
            );
            dropped += 1;
        }
        Ok(dropped)
    }

    pub fn wait(&self, wait_id: &str) -> Result<Option<WaitInstance>, EngineError> {
        Ok(self.waits.get(wait_id)?)
    }

    pub fn waits_for_owner(&self, owner: &str) -> Result<Vec<WaitInstance>, EngineError> {
        let mut waits = Vec::new();
        for wait_id in self.by_owner.members(owner)? {
            if let Some(wait) = self.waits.get(&wait_id)? {
                waits.push(wait);
            }
        }
        Ok(waits)
    }

    pub fn response(&self, correlation_id: &str) -> Result<Option<ResponseData>, EngineError> {
        Ok(self.responses.get(correlation_id)?)
    }

    pub fn buffered_count(&self) -> Result<usize, EngineError> {
        Ok(self.buffered.scan_prefix("")?.len())
    }
}
