//! Shared identifiers and clock helpers.

use chrono::Utc;

/// Runtime id of a node execution (one per attempt)
pub type RuntimeId = String;
/// Plan node id, stable across attempts
pub type SetupId = String;
pub type PlanExecutionId = String;
pub type CorrelationId = String;

/// Fresh random id for runtime entities
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Deterministic id derived from its parts; re-deriving after a crash yields the same value.
pub fn derive_id(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0u8]);
    }
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
