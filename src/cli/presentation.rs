//! CLI presentation: tables and colored statuses.

use crate::engine::PlanExecution;
use crate::execution::{NodeExecution, Status};
use crate::interrupt::{Interrupt, InterruptState};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use owo_colors::OwoColorize;

fn colored_status(status: Status) -> String {
    let label = status.to_string();
    if status.is_positive() {
        label.green().to_string()
    } else if status.is_broken() || status == Status::Aborted {
        label.red().to_string()
    } else if status.is_waiting() || status == Status::Paused {
        label.yellow().to_string()
    } else {
        label.cyan().to_string()
    }
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

pub fn format_plan_summary(execution: &PlanExecution) -> String {
    let duration = execution
        .end_ts
        .map(|end| format!("{} ms", end.saturating_sub(execution.start_ts)))
        .unwrap_or_else(|| "running".to_string());
    format!(
        "Plan execution {} ({}): {}{}  [{}]",
        execution.uuid.bold(),
        execution.plan_id,
        colored_status(execution.status),
        if execution.paused { " (paused)" } else { "" },
        duration
    )
}

/// One row per attempt, indented by depth, oldest first.
pub fn format_node_table(nodes: &[NodeExecution]) -> String {
    let mut nodes: Vec<&NodeExecution> = nodes.iter().collect();
    nodes.sort_by_key(|n| (n.created_at, n.context.depth()));

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Node", "Status", "Mode", "Attempt", "Runtime ID", "Advise", "Failure"]);
    for node in nodes {
        let indent = "  ".repeat(node.context.depth().saturating_sub(1));
        let attempt = if node.old_retry {
            format!("{} (superseded)", node.retry_index())
        } else {
            node.retry_index().to_string()
        };
        let advise = node
            .advise
            .as_ref()
            .and_then(|r| r.advise.as_ref())
            .map(|a| a.name().to_string())
            .unwrap_or_else(|| "-".to_string());
        let failure = node
            .failure_info
            .as_ref()
            .map(|f| f.message.clone())
            .unwrap_or_default();
        table.add_row(vec![
            format!("{}{}", indent, node.identifier),
            colored_status(node.status),
            node.mode.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string()),
            attempt,
            short(&node.uuid).to_string(),
            advise,
            failure,
        ]);
    }
    table.to_string()
}

pub fn format_interrupts(interrupts: &[Interrupt]) -> String {
    if interrupts.is_empty() {
        return String::new();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Interrupt", "Type", "Target", "Outcome"]);
    for interrupt in interrupts {
        let outcome = match &interrupt.state {
            InterruptState::ProcessedSuccessfully => "applied".green().to_string(),
            InterruptState::ProcessedUnsuccessfully { reason } => format!("{}: {}", "rejected".red(), reason),
            InterruptState::Processing => "processing".yellow().to_string(),
            InterruptState::Registered => "registered".yellow().to_string(),
        };
        table.add_row(vec![
            short(&interrupt.uuid).to_string(),
            interrupt.interrupt_type.to_string(),
            interrupt
                .node_execution_id
                .as_deref()
                .map(short)
                .unwrap_or("plan")
                .to_string(),
            outcome,
        ]);
    }
    table.to_string()
}
