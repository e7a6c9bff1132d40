// src/work/mod.rs

//! What a task actually does.
//!
//! The engine treats work as opaque: it hands a [`WorkContext`] with the
//! upstream outputs and run parameters to [`TaskWork::run`] and records the
//! returned JSON value (or error) on the attempt.
//!
//! - [`command`] runs a shell command (used by TOML-configured pipelines).
//! - [`connector`] adapts data connectors and transformations into work.
//! - [`circuit`] wraps any work in a circuit breaker.

pub mod circuit;
pub mod command;
pub mod connector;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dag::TaskName;
use crate::errors::TaskError;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerWork, CircuitState};
pub use command::CommandWork;
pub use connector::{
    Ack, Connector, DestinationConfig, Row, Rows, SinkWork, SourceConfig, SourceWork,
    TransformWork, Transformation,
};

/// Outputs of a task's direct dependencies, keyed by upstream task name.
pub type TaskInput = BTreeMap<TaskName, Value>;

/// Run-level parameters shared by every task of an execution.
pub type Parameters = BTreeMap<String, Value>;

/// Everything a single attempt gets to see.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub execution_id: Uuid,
    pub task: TaskName,
    pub attempt: u32,
    pub inputs: TaskInput,
    pub parameters: Parameters,
    /// Cancelled when the run is cancelled or the attempt is abandoned.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait TaskWork: Send + Sync {
    async fn run(&self, ctx: WorkContext) -> Result<Value, TaskError>;

    /// Short human-readable description used in logs and `--dry-run`.
    fn describe(&self) -> String {
        "<work>".to_string()
    }
}

/// Work backed by an async closure.
pub struct FnWork<F> {
    f: F,
    label: String,
}

impl<F> fmt::Debug for FnWork<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWork").field("label", &self.label).finish()
    }
}

impl<F> FnWork<F> {
    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Wrap an async closure as [`TaskWork`].
pub fn work_fn<F, Fut>(f: F) -> FnWork<F>
where
    F: Fn(WorkContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    FnWork {
        f,
        label: "fn".to_string(),
    }
}

#[async_trait]
impl<F, Fut> TaskWork for FnWork<F>
where
    F: Fn(WorkContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn run(&self, ctx: WorkContext) -> Result<Value, TaskError> {
        (self.f)(ctx).await
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
