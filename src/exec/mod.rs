// src/exec/mod.rs

//! Executor backends.
//!
//! - [`backend`] defines the [`Executor`] trait and the job/completion types.
//! - [`local`] runs jobs on a bounded pool of tokio tasks.
//! - [`queue`], [`worker`] and [`distributed`] ship jobs to workers over a
//!   serialized work queue.

pub mod backend;
pub mod distributed;
pub mod local;
pub mod queue;
pub mod worker;

pub use backend::{BoxFuture, Completion, Executor, Job, RunKey, TaskHandle};
pub use distributed::DistributedExecutor;
pub use local::LocalExecutor;
pub use queue::{ControlMessage, WorkItem, WorkQueue, WorkerEndpoint, WorkerMessage, work_queue};
pub use worker::{WorkRegistry, WorkerPool};
