// src/exec/backend.rs

//! Pluggable executor abstraction.
//!
//! The run loop talks to an [`Executor`] instead of spawning work itself.
//! [`LocalExecutor`](crate::exec::LocalExecutor) runs jobs on a bounded
//! tokio pool; [`DistributedExecutor`](crate::exec::DistributedExecutor)
//! serializes them onto a work queue drained by remote workers. Tests can
//! provide their own implementation that completes jobs synchronously.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dag::TaskName;
use crate::errors::{Result, TaskError};
use crate::work::{Parameters, TaskInput, TaskWork};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identity of one task attempt inside one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub execution_id: Uuid,
    pub task: TaskName,
    pub attempt: u32,
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.execution_id, self.task, self.attempt)
    }
}

/// Handle returned by [`Executor::submit`].
pub type TaskHandle = RunKey;

/// One attempt handed to an executor.
#[derive(Clone)]
pub struct Job {
    pub key: RunKey,
    pub work: Arc<dyn TaskWork>,
    pub inputs: TaskInput,
    pub parameters: Parameters,
    pub timeout: Duration,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("key", &self.key)
            .field("work", &self.work.describe())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Result of one dispatched attempt.
#[derive(Debug, Clone)]
pub struct Completion {
    pub handle: TaskHandle,
    pub result: std::result::Result<Value, TaskError>,
    pub finished_at: DateTime<Utc>,
}

impl Completion {
    pub fn new(handle: TaskHandle, result: std::result::Result<Value, TaskError>) -> Self {
        Self {
            handle,
            result,
            finished_at: Utc::now(),
        }
    }
}

/// Trait abstracting where and how attempts run.
///
/// Every submitted job produces exactly one [`Completion`] from
/// [`await_any`](Executor::await_any), including jobs that time out or
/// are cancelled. Implementations never deliver a completion for a handle
/// they no longer track.
pub trait Executor: Send {
    /// Dispatch a job. Waits only while the backend is saturated.
    fn submit(&mut self, job: Job) -> BoxFuture<'_, Result<TaskHandle>>;

    /// Wait for any dispatched job to finish. `None` when nothing is in flight.
    fn await_any(&mut self) -> BoxFuture<'_, Option<Completion>>;

    /// Best-effort cancellation. The job still yields a completion.
    fn cancel(&mut self, handle: &TaskHandle);

    /// Jobs submitted whose completion has not been returned yet.
    fn in_flight(&self) -> usize;

    /// Maximum number of jobs in flight at once.
    fn capacity(&self) -> usize;

    fn name(&self) -> &'static str;
}
