// src/errors.rs

//! Crate-wide error types.
//!
//! [`RundagError`] covers construction and infrastructure failures that abort
//! a run before (or instead of) executing tasks. [`TaskError`] is the
//! per-attempt failure recorded on a `TaskRun` and fed to the retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::Status;

#[derive(Error, Debug)]
pub enum RundagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Duplicate task name: {0}")]
    DuplicateTask(String),

    #[error("task '{task}' has unknown dependency '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Cycle detected in DAG: {}", cycle_path(.members))]
    DagCycle { members: Vec<String> },

    #[error("invalid {subject} transition: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: Status,
        to: Status,
    },

    #[error("Executor error: {0}")]
    Executor(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Render cycle members as `A -> B -> A`.
fn cycle_path(members: &[String]) -> String {
    match members.first() {
        Some(first) => {
            let mut parts: Vec<&str> = members.iter().map(String::as_str).collect();
            parts.push(first);
            parts.join(" -> ")
        }
        None => String::from("<empty>"),
    }
}

/// Failure of a single task attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskError {
    /// The work itself returned an error.
    #[error("{0}")]
    Failure(String),

    /// The attempt exceeded its per-task timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The attempt observed a cancellation request and stopped.
    #[error("cancelled")]
    Cancelled,

    /// A circuit breaker rejected the call without running the work.
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),
}

impl TaskError {
    pub fn failure(msg: impl std::fmt::Display) -> Self {
        TaskError::Failure(msg.to_string())
    }

    /// Timeouts and circuit rejections are retried like ordinary failures;
    /// cancellation never is.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskError::Cancelled)
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Failure(format!("{err:#}"))
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, RundagError>;
