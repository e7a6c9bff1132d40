// src/dag/mod.rs

//! DAG representation and scheduling.
//!
//! - [`task`] defines the unit of work and its dependency declaration.
//! - [`graph`] validates a set of tasks into an acyclic [`Dag`].
//! - [`scheduler`] answers "what can run next" without holding any state.

pub mod graph;
pub mod scheduler;
pub mod task;

pub use graph::Dag;
pub use scheduler::{blocked_by, eligible_tasks, ordered_eligible};
pub use task::{DEFAULT_TASK_TIMEOUT, Task, TaskName};
