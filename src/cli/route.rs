//! CLI route: single route table and run context.

use crate::cli::parse::Commands;
use crate::cli::presentation::{format_interrupts, format_node_table, format_plan_summary};
use crate::config::{CadenceConfig, ConfigLoader};
use crate::engine::{Engine, Orchestrator};
use crate::error::EngineError;
use crate::interrupt::{InterruptRequest, InterruptType};
use crate::plan::Plan;
use crate::store::Storage;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Runtime context for CLI execution: workspace and effective configuration.
pub struct RunContext {
    workspace_root: PathBuf,
    config: CadenceConfig,
}

impl RunContext {
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, EngineError> {
        let config = match config_path {
            Some(ref path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&workspace_root)?,
        }
        .validated()?;
        Ok(Self {
            workspace_root,
            config,
        })
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    fn open_engine(&self) -> Result<Arc<Engine>, EngineError> {
        let storage = Storage::from_config(&self.config.storage, &self.workspace_root)?;
        let engine = Engine::builder(storage, self.config.clone()).build()?;
        debug!(workspace = %self.workspace_root.display(), "Engine opened");
        Ok(Arc::new(engine))
    }

    pub async fn execute(&self, command: &Commands) -> Result<String, EngineError> {
        match command {
            Commands::Run {
                plan,
                setup,
                timeout_secs,
            } => self.handle_run(plan, setup, *timeout_secs).await,
            Commands::Status {
                plan_execution_id,
                format,
            } => self.handle_status(plan_execution_id, format),
            Commands::Interrupt {
                plan_execution_id,
                interrupt_type,
                node,
                reason,
                metadata,
                timeout_secs,
            } => {
                self.handle_interrupt(
                    plan_execution_id,
                    interrupt_type,
                    node.as_deref(),
                    reason.as_deref(),
                    metadata.as_deref(),
                    *timeout_secs,
                )
                .await
            }
            Commands::Notify {
                correlation_id,
                error,
                payload,
                timeout_secs,
            } => {
                self.handle_notify(correlation_id, *error, payload.as_deref(), *timeout_secs)
                    .await
            }
            Commands::Validate { plan } => self.handle_validate(plan),
            Commands::Config { defaults } => self.handle_config(*defaults),
        }
    }

    async fn handle_run(&self, plan_path: &Path, setup: &[(String, String)], timeout_secs: u64) -> Result<String, EngineError> {
        let plan = read_plan(plan_path)?;
        let engine = self.open_engine()?;
        let orchestrator = Orchestrator::new(Arc::clone(&engine))?;
        let setup: BTreeMap<String, String> = setup.iter().cloned().collect();

        let execution = engine.start_plan_execution(plan, setup)?;
        info!(plan_execution_id = %execution.uuid, "Running plan");
        let idle = orchestrator
            .run_until_idle(Duration::from_secs(timeout_secs))
            .await?;
        orchestrator.stop().await?;
        let mut out = self.render_status(&engine, &execution.uuid)?;
        if !idle {
            out.push_str("\nStill busy when the timeout ran out; check again with `cadence status`.");
        }
        Ok(out)
    }

    fn handle_status(&self, plan_execution_id: &str, format: &str) -> Result<String, EngineError> {
        let engine = self.open_engine()?;
        if format == "json" {
            let execution = engine.plan_executions().require(plan_execution_id)?;
            let nodes = engine.nodes().for_plan_execution(plan_execution_id)?;
            let interrupts = engine.interrupts().store().for_plan_execution(plan_execution_id)?;
            let out = json!({
                "plan_execution": execution,
                "nodes": nodes,
                "interrupts": interrupts,
            });
            return Ok(serde_json::to_string_pretty(&out)?);
        }
        self.render_status(&engine, plan_execution_id)
    }

    async fn handle_interrupt(
        &self,
        plan_execution_id: &str,
        interrupt_type: &str,
        node: Option<&str>,
        reason: Option<&str>,
        metadata: Option<&str>,
        timeout_secs: u64,
    ) -> Result<String, EngineError> {
        let interrupt_type: InterruptType = interrupt_type.parse()?;
        let mut request = InterruptRequest::new(interrupt_type, plan_execution_id).issued_by("cli");
        if let Some(node) = node {
            request = request.for_node(node);
        }
        if let Some(reason) = reason {
            request = request.with_reason(reason);
        }
        if let Some(metadata) = metadata {
            request = request.with_metadata(parse_json("metadata", metadata)?);
        }

        let engine = self.open_engine()?;
        let orchestrator = Orchestrator::new(Arc::clone(&engine))?;
        let interrupt = engine.register_interrupt(request)?;
        orchestrator
            .run_until_idle(Duration::from_secs(timeout_secs))
            .await?;
        orchestrator.stop().await?;

        let interrupt = engine.interrupts().store().get(&interrupt.uuid)?;
        let mut out = format_interrupts(&[interrupt]);
        out.push('\n');
        out.push_str(&self.render_status(&engine, plan_execution_id)?);
        Ok(out)
    }

    async fn handle_notify(
        &self,
        correlation_id: &str,
        is_error: bool,
        payload: Option<&str>,
        timeout_secs: u64,
    ) -> Result<String, EngineError> {
        let payload = match payload {
            Some(raw) => parse_json("payload", raw)?,
            None => Value::Null,
        };
        let engine = self.open_engine()?;
        let orchestrator = Orchestrator::new(Arc::clone(&engine))?;
        let outcome = engine.notify(correlation_id, payload, is_error)?;
        orchestrator
            .run_until_idle(Duration::from_secs(timeout_secs))
            .await?;
        orchestrator.stop().await?;
        Ok(format!("{}: {:?}", correlation_id, outcome))
    }

    fn handle_validate(&self, plan_path: &Path) -> Result<String, EngineError> {
        let plan = read_plan(plan_path)?;
        let engine = Engine::builder(Storage::in_memory(), self.config.clone()).build()?;
        engine.validate_plan(&plan)?;
        Ok(format!(
            "Plan {} is valid: {} nodes, {} barriers",
            plan.uuid,
            plan.nodes.len(),
            plan.barriers.len()
        ))
    }

    fn handle_config(&self, defaults: bool) -> Result<String, EngineError> {
        let rendered = if defaults {
            ConfigLoader::default_toml()
        } else {
            toml::to_string_pretty(&self.config)
        };
        rendered.map_err(|e| EngineError::ConfigError(format!("Could not render config: {}", e)))
    }

    fn render_status(&self, engine: &Engine, plan_execution_id: &str) -> Result<String, EngineError> {
        let execution = engine.plan_executions().require(plan_execution_id)?;
        let nodes = engine.nodes().for_plan_execution(plan_execution_id)?;
        let interrupts = engine.interrupts().store().for_plan_execution(plan_execution_id)?;

        let mut out = format_plan_summary(&execution);
        out.push('\n');
        out.push_str(&format_node_table(&nodes));
        let interrupts = format_interrupts(&interrupts);
        if !interrupts.is_empty() {
            out.push('\n');
            out.push_str(&interrupts);
        }
        Ok(out)
    }
}

fn read_plan(path: &Path) -> Result<Plan, EngineError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| EngineError::ConfigError(format!("Cannot read plan {}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&raw)?)
}

fn parse_json(what: &str, raw: &str) -> Result<Value, EngineError> {
    serde_json::from_str(raw).map_err(|e| EngineError::ConfigError(format!("Invalid {} JSON: {}", what, e)))
}
