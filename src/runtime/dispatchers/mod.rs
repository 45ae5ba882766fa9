//! Dispatcher implementations for Runtime
//!
//! This module contains the dispatcher logic split into separate concerns:
//! - `orchestration`: consumes orchestrator messages, runs turns and links child workflows
//! - `worker`: executes activities with retry and timeout policy

mod orchestration;
mod worker;

pub use worker::ActivityDispatcher;
pub(crate) use orchestration::child_result;
