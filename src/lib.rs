//! Cadence: Durable Pipeline Orchestration
//!
//! Walks plan graphs of stages, steps and strategy iterations as a durable
//! state machine. Facilitators decide how a node runs, advisers decide what
//! happens after it ends, wait-notify correlates asynchronous results back to
//! waiting nodes, and interrupts (abort, pause, retry, ...) reach running
//! executions without losing consistency.

pub mod adviser;
pub mod barrier;
pub mod bus;
pub mod cli;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod execution;
pub mod facilitator;
pub mod interrupt;
pub mod logging;
pub mod outputs;
pub mod plan;
pub mod restraint;
pub mod step;
pub mod store;
pub mod timer;
pub mod types;
pub mod wait_notify;
