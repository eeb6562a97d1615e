//! CLI domain: parse, route, output, and presentation only.
//! Orchestration lives in the engine; the route table only wires it up.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands};
pub use presentation::{format_interrupts, format_node_table, format_plan_summary};
pub use route::RunContext;
