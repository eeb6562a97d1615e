//! Integration test modules

pub mod test_utils;

mod adviser_flow;
mod barrier_flow;
mod cli_flow;
mod durability;
mod interrupt_flow;
mod plan_flow;
mod restraint_flow;
mod wait_notify_flow;
