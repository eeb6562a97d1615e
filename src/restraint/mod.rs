//! Resource Restraint Gate
//!
//! Limits concurrent holders of a named resource. Each resource has one
//! ledger document holding its capacity, the next sequence number and the
//! live holders in sequence order; every change is a compare-and-swap on that
//! document, so no lock is held across decisions.
//!
//! Fairness is strict FIFO: a new request is blocked while any earlier holder
//! is still blocked, even if it would fit. Releases promote blocked holders in
//! sequence order and stop at the first one that does not fit. Promotions are
//! announced through wait-notify with the instance id as correlation id.

use crate::error::EngineError;
use crate::store::{Collection, KeyIndex, Storage};
use crate::types::now_millis;
use crate::wait_notify::WaitNotifyService;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};

const TREE_LEDGERS: &str = "restraint_ledgers";
const TREE_HISTORY: &str = "restraint_history";
const TREE_BY_ENTITY: &str = "restraint_by_entity";

pub const DEFAULT_CAPACITY: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquireMode {
    /// Takes the whole capacity
    Exclusive,
    /// Takes `permits` of the capacity
    Bounded { permits: u32 },
}

/// When a hold is released on its own
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldingScope {
    /// When the acquiring node ends
    #[default]
    Node,
    /// When the acquiring node's parent ends
    Parent,
    /// When the plan execution ends
    Plan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestraintState {
    Blocked,
    Active,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestraintInstance {
    pub uuid: String,
    pub resource_unit: String,
    /// Node or plan execution whose end releases the hold
    pub release_entity_id: String,
    pub scope: HoldingScope,
    pub mode: AcquireMode,
    pub permits: u32,
    /// FIFO sequence number, unique per resource
    pub order: u64,
    pub state: RestraintState,
    pub created_at: u64,
    #[serde(default)]
    pub activated_at: Option<u64>,
    #[serde(default)]
    pub finished_at: Option<u64>,
}

impl RestraintInstance {
    fn weight(&self, capacity: u32) -> u32 {
        match self.mode {
            AcquireMode::Exclusive => capacity,
            AcquireMode::Bounded { permits } => permits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLedger {
    pub resource_unit: String,
    pub capacity: u32,
    pub next_order: u64,
    /// Active and blocked holders in sequence order
    pub holders: Vec<RestraintInstance>,
}

impl ResourceLedger {
    fn new(resource_unit: &str, capacity: u32) -> Self {
        Self {
            resource_unit: resource_unit.to_string(),
            capacity,
            next_order: 1,
            holders: Vec::new(),
        }
    }

    pub fn active_permits(&self) -> u32 {
        self.holders
            .iter()
            .filter(|h| h.state == RestraintState::Active)
            .map(|h| h.weight(self.capacity))
            .sum()
    }

    pub fn has_blocked(&self) -> bool {
        self.holders
            .iter()
            .any(|h| h.state == RestraintState::Blocked)
    }

    /// Why the live holders would not fit under `capacity`, if they would not
    fn capacity_conflict(&self, capacity: u32) -> Option<String> {
        let active: u32 = self
            .holders
            .iter()
            .filter(|h| h.state == RestraintState::Active)
            .map(|h| h.weight(capacity))
            .sum();
        if active > capacity {
            return Some(format!("{} permits are active", active));
        }
        self.holders
            .iter()
            .find(|h| matches!(h.mode, AcquireMode::Bounded { permits } if permits > capacity))
            .map(|h| format!("request {} asks for {} permits", h.uuid, h.permits))
    }

    /// Activate blocked holders in order while they fit
    fn promote(&mut self, now: u64) -> Vec<RestraintInstance> {
        let capacity = self.capacity;
        let mut active = self.active_permits();
        let mut promoted = Vec::new();
        for holder in self
            .holders
            .iter_mut()
            .filter(|h| h.state == RestraintState::Blocked)
        {
            let weight = holder.weight(capacity);
            if active + weight > capacity {
                break;
            }
            holder.state = RestraintState::Active;
            holder.activated_at = Some(now);
            active += weight;
            promoted.push(holder.clone());
        }
        promoted
    }
}

#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub instance_id: String,
    pub resource_unit: String,
    pub release_entity_id: String,
    pub scope: HoldingScope,
    pub mode: AcquireMode,
}

#[derive(Clone)]
pub struct RestraintGate {
    ledgers: Collection<ResourceLedger>,
    history: Collection<RestraintInstance>,
    by_entity: KeyIndex,
    capacities: HashMap<String, u32>,
    wait_notify: WaitNotifyService,
}

impl RestraintGate {
    pub fn open(
        storage: &Storage,
        capacities: HashMap<String, u32>,
        wait_notify: WaitNotifyService,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            ledgers: Collection::open(storage, TREE_LEDGERS)?,
            history: Collection::open(storage, TREE_HISTORY)?,
            by_entity: KeyIndex::open(storage, TREE_BY_ENTITY)?,
            capacities,
            wait_notify,
        })
    }

    fn configured_capacity(&self, resource_unit: &str) -> u32 {
        self.capacities
            .get(resource_unit)
            .copied()
            .unwrap_or(DEFAULT_CAPACITY)
    }

    /// Set a resource's capacity; raising it may promote blocked holders.
    ///
    /// A capacity the live holders no longer fit into is refused: active
    /// permits above it, or a bounded request asking for more than it.
    pub fn define_resource(&self, resource_unit: &str, capacity: u32) -> Result<(), EngineError> {
        if capacity == 0 {
            return Err(EngineError::ConfigError(format!(
                "Resource '{}' needs a capacity of at least 1",
                resource_unit
            )));
        }
        let mut promoted = Vec::new();
        let mut conflict = None;
        self.ledgers.upsert(
            resource_unit,
            || ResourceLedger::new(resource_unit, capacity),
            |ledger| {
                promoted.clear();
                conflict = ledger.capacity_conflict(capacity);
                if conflict.is_some() {
                    return false;
                }
                ledger.capacity = capacity;
                promoted = ledger.promote(now_millis());
                true
            },
        )?;
        if let Some(reason) = conflict {
            return Err(EngineError::ConfigError(format!(
                "Resource '{}' cannot shrink to {}: {}",
                resource_unit, capacity, reason
            )));
        }
        info!(resource_unit, capacity, "Resource defined");
        self.announce(&promoted)
    }

    /// Enter the gate. Idempotent per instance id.
    pub fn acquire(&self, request: &AcquireRequest) -> Result<RestraintInstance, EngineError> {
        let capacity = self.configured_capacity(&request.resource_unit);
        if let AcquireMode::Bounded { permits } = request.mode {
            if permits == 0 {
                return Err(EngineError::ConfigError(format!(
                    "Bounded acquire on '{}' needs at least one permit",
                    request.resource_unit
                )));
            }
        }

        let mut acquired = None;
        let mut rejection = None;
        self.ledgers.upsert(
            &request.resource_unit,
            || ResourceLedger::new(&request.resource_unit, capacity),
            |ledger| {
                acquired = None;
                rejection = None;
                if let Some(existing) = ledger.holders.iter().find(|h| h.uuid == request.instance_id) {
                    acquired = Some(existing.clone());
                    return false;
                }
                let permits = match request.mode {
                    AcquireMode::Exclusive => ledger.capacity,
                    AcquireMode::Bounded { permits } => permits,
                };
                if permits > ledger.capacity {
                    rejection = Some(permits);
                    return false;
                }
                let fits = ledger.active_permits() + permits <= ledger.capacity;
                let state = if fits && !ledger.has_blocked() {
                    RestraintState::Active
                } else {
                    RestraintState::Blocked
                };
                let now = now_millis();
                let instance = RestraintInstance {
                    uuid: request.instance_id.clone(),
                    resource_unit: request.resource_unit.clone(),
                    release_entity_id: request.release_entity_id.clone(),
                    scope: request.scope,
                    mode: request.mode,
                    permits,
                    order: ledger.next_order,
                    state,
                    created_at: now,
                    activated_at: (state == RestraintState::Active).then_some(now),
                    finished_at: None,
                };
                ledger.next_order += 1;
                ledger.holders.push(instance.clone());
                acquired = Some(instance);
                true
            },
        )?;

        if let Some(permits) = rejection {
            return Err(EngineError::ConfigError(format!(
                "Acquire of {} permits on '{}' can never be satisfied",
                permits, request.resource_unit
            )));
        }
        let instance = acquired.ok_or_else(|| {
            EngineError::ResourceNotDefined(request.resource_unit.clone())
        })?;
        self.by_entity.add(
            &instance.release_entity_id,
            &entity_member(&instance.resource_unit, &instance.uuid),
        )?;
        debug!(
            resource_unit = %instance.resource_unit,
            instance_id = %instance.uuid,
            order = instance.order,
            state = ?instance.state,
            "Restraint acquired"
        );
        Ok(instance)
    }

    /// Leave the gate (or withdraw a blocked request) and promote whoever
    /// fits next. Returns the promoted instances.
    pub fn release(
        &self,
        resource_unit: &str,
        instance_id: &str,
    ) -> Result<Vec<RestraintInstance>, EngineError> {
        let now = now_millis();
        let mut removed = None;
        let mut promoted = Vec::new();
        self.ledgers.update(resource_unit, |ledger| {
            removed = None;
            promoted.clear();
            let Some(position) = ledger.holders.iter().position(|h| h.uuid == instance_id) else {
                return false;
            };
            removed = Some(ledger.holders.remove(position));
            promoted = ledger.promote(now);
            true
        })?;

        let Some(mut finished) = removed else {
            return Ok(Vec::new());
        };
        finished.state = RestraintState::Finished;
        finished.finished_at = Some(now);
        self.history.put(&finished.uuid, &finished)?;
        self.by_entity.remove(
            &finished.release_entity_id,
            &entity_member(resource_unit, instance_id),
        )?;
        debug!(
            resource_unit,
            instance_id,
            promoted = promoted.len(),
            "Restraint released"
        );
        self.announce(&promoted)?;
        Ok(promoted)
    }

    /// Release every hold (active or blocked) owned by `entity_id`.
    pub fn release_for_entity(&self, entity_id: &str) -> Result<usize, EngineError> {
        let mut released = 0;
        for member in self.by_entity.members(entity_id)? {
            let Some((resource_unit, instance_id)) = member.rsplit_once('/') else {
                continue;
            };
            self.release(resource_unit, instance_id)?;
            released += 1;
        }
        if released > 0 {
            info!(entity_id, released, "Restraints released for entity");
        }
        Ok(released)
    }

    pub fn ledger(&self, resource_unit: &str) -> Result<Option<ResourceLedger>, EngineError> {
        Ok(self.ledgers.get(resource_unit)?)
    }

    /// Live holders of a resource in sequence order
    pub fn holders(&self, resource_unit: &str) -> Result<Vec<RestraintInstance>, EngineError> {
        Ok(self
            .ledgers
            .get(resource_unit)?
            .map(|l| l.holders)
            .unwrap_or_default())
    }

    /// Current view of an instance, live or finished
    pub fn instance(
        &self,
        resource_unit: &str,
        instance_id: &str,
    ) -> Result<Option<RestraintInstance>, EngineError> {
        if let Some(live) = self
            .holders(resource_unit)?
            .into_iter()
            .find(|h| h.uuid == instance_id)
        {
            return Ok(Some(live));
        }
        Ok(self.history.get(instance_id)?)
    }

    fn announce(&self, promoted: &[RestraintInstance]) -> Result<(), EngineError> {
        for instance in promoted {
            info!(
                resource_unit = %instance.resource_unit,
                instance_id = %instance.uuid,
                order = instance.order,
                "Restraint promoted"
            );
            self.wait_notify.notify(
                &instance.uuid,
                json!({
                    "resource_unit": instance.resource_unit,
                    "instance_id": instance.uuid,
                    "order": instance.order,
                }),
            )?;
        }
        Ok(())
    }
}

fn entity_member(resource_unit: &str, instance_id: &str) -> String {
    format!("{}/{}", resource_unit, instance_id)
}
