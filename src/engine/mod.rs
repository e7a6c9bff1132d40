// src/engine/mod.rs

//! Orchestration engine.
//!
//! - [`pipeline`] turns a set of tasks into executions.
//! - [`runner`] is the control loop driving one execution against an
//!   [`Executor`](crate::exec::Executor).
//! - [`orchestrator`] runs executions in the background and exposes status
//!   and cancellation by id.

pub mod orchestrator;
pub mod pipeline;
pub mod runner;

pub use orchestrator::Orchestrator;
pub use pipeline::{DEFAULT_MAX_PARALLEL_TASKS, Pipeline};
pub use runner::{RunControl, RunLoop, RunReport};
