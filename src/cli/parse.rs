//! CLI parse: clap types for Cadence. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cadence CLI - durable pipeline orchestration
#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Run, inspect and steer durable pipeline executions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory (storage and config/ live here)
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a plan from a JSON file and drive it until nothing is left to do
    Run {
        /// Plan file (JSON)
        plan: PathBuf,
        /// Setup abstractions as key=value (account, org, project)
        #[arg(long = "setup", value_parser = parse_key_value)]
        setup: Vec<(String, String)>,
        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },
    /// Show the node executions of a plan execution
    Status {
        plan_execution_id: String,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Raise an interrupt (abort, abort-all, pause, resume, retry, expire-all,
    /// custom-failure, mark-success, mark-failed)
    Interrupt {
        plan_execution_id: String,
        interrupt_type: String,
        /// Target node execution
        #[arg(long)]
        node: Option<String>,
        #[arg(long)]
        reason: Option<String>,
        /// Extra data as JSON, e.g. custom failure message and types
        #[arg(long)]
        metadata: Option<String>,
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },
    /// Deliver a result for a correlation id, as a worker would
    Notify {
        correlation_id: String,
        /// Deliver as an error response
        #[arg(long)]
        error: bool,
        /// Payload as JSON
        #[arg(long)]
        payload: Option<String>,
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },
    /// Check a plan file against the registered facilitators, advisers and steps
    Validate {
        plan: PathBuf,
    },
    /// Print the effective configuration as TOML
    Config {
        /// Print the built-in defaults instead
        #[arg(long)]
        defaults: bool,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("Expected key=value, got '{}'", raw))
}
