//! Configuration System
//!
//! Layered configuration: merge-policy defaults, then the global config file,
//! then workspace files, then `CADENCE__SECTION__KEY` environment variables.
//! `validate` reports every problem at once.

use crate::adviser::RepairAction;
use crate::error::EngineError;
use crate::logging::LoggingConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod loader;
mod merge;
mod sources;

pub use loader::ConfigLoader;
pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub wait_notify: WaitNotifyConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub intervention: InterventionConfig,

    /// Named resources guarded by the restraint gate
    #[serde(default)]
    pub restraints: HashMap<String, ResourceConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where durable engine state lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled directory, relative paths resolve against the workspace root
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Use a throwaway store (removed on drop)
    #[serde(default)]
    pub temporary: bool,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".cadence/store")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            temporary: false,
        }
    }
}

impl StorageConfig {
    pub fn resolve_path(&self, workspace_root: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            workspace_root.join(&self.path)
        }
    }
}

/// Orchestrator runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Worker tasks consuming engine, notify and interrupt topics
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Times a failed delivery is re-published before it is dropped
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,

    /// Idle poll interval for workers (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timer scan interval (milliseconds)
    #[serde(default = "default_timer_tick_ms")]
    pub timer_tick_ms: u64,
}

fn default_workers() -> usize {
    4
}

fn default_max_redeliveries() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_timer_tick_ms() -> u64 {
    250
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_redeliveries: default_max_redeliveries(),
            poll_interval_ms: default_poll_interval_ms(),
            timer_tick_ms: default_timer_tick_ms(),
        }
    }
}

/// Wait-notify correlator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitNotifyConfig {
    /// How long a notify for an unknown correlation id is kept (milliseconds)
    #[serde(default = "default_grace_period_ms")]
    pub notify_grace_period_ms: u64,

    /// How often buffered notifies are swept (milliseconds)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_grace_period_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

impl Default for WaitNotifyConfig {
    fn default() -> Self {
        Self {
            notify_grace_period_ms: default_grace_period_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// In-process task queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_workers")]
    pub workers: usize,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Attempts for a task runner that reports a retryable error
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: usize,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_dispatch_workers() -> usize {
    2
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_max_retry_attempts() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_dispatch_workers(),
            max_queue_size: default_max_queue_size(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Defaults for intervention waits that do not carry their own
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionConfig {
    #[serde(default = "default_intervention_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default)]
    pub default_repair_action: RepairAction,
}

fn default_intervention_timeout_ms() -> u64 {
    24 * 60 * 60 * 1000
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_intervention_timeout_ms(),
            default_repair_action: RepairAction::default(),
        }
    }
}

/// A named resource guarded by the restraint gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_capacity")]
    pub capacity: u32,
}

fn default_capacity() -> u32 {
    1
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Storage(String),
    Engine(String),
    WaitNotify(String),
    Dispatch(String),
    Restraint(String, String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
            ValidationError::Engine(msg) => write!(f, "Engine: {}", msg),
            ValidationError::WaitNotify(msg) => write!(f, "Wait-notify: {}", msg),
            ValidationError::Dispatch(msg) => write!(f, "Dispatch: {}", msg),
            ValidationError::Restraint(name, msg) => write!(f, "Resource '{}': {}", name, msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl CadenceConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if !self.storage.temporary && self.storage.path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage(
                "Store path cannot be empty".to_string(),
            ));
        }
        if self.engine.workers == 0 {
            errors.push(ValidationError::Engine(
                "At least one worker is required".to_string(),
            ));
        }
        if self.engine.poll_interval_ms == 0 || self.engine.timer_tick_ms == 0 {
            errors.push(ValidationError::Engine(
                "Poll and timer intervals must be positive".to_string(),
            ));
        }
        if self.wait_notify.sweep_interval_ms == 0 {
            errors.push(ValidationError::WaitNotify(
                "Sweep interval must be positive".to_string(),
            ));
        }
        if self.dispatch.workers == 0 {
            errors.push(ValidationError::Dispatch(
                "At least one task worker is required".to_string(),
            ));
        }
        if self.dispatch.max_queue_size == 0 {
            errors.push(ValidationError::Dispatch(
                "Queue size must be positive".to_string(),
            ));
        }
        for (name, resource) in &self.restraints {
            if resource.capacity == 0 {
                errors.push(ValidationError::Restraint(
                    name.clone(),
                    "Capacity must be at least 1".to_string(),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Fold validation errors into a single configuration error
    pub fn validated(self) -> Result<Self, EngineError> {
        self.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            EngineError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                messages.join("\n")
            ))
        })?;
        Ok(self)
    }
}

/// Shared configuration handle for runtime reloads
#[derive(Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<CadenceConfig>>,
}

impl ConfigManager {
    pub fn new(config: CadenceConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Reload configuration from files; the old config stays if the new one is invalid
    pub fn reload(&self, workspace_root: &Path) -> Result<(), EngineError> {
        let new_config = ConfigLoader::load(workspace_root)?.validated()?;
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn get(&self) -> CadenceConfig {
        self.config.read().clone()
    }
}
