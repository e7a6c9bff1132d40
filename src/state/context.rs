// src/state/context.rs

//! Execution records: one [`ExecutionContext`] per pipeline run and one
//! [`TaskRun`] per task attempt.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dag::TaskName;
use crate::state::Status;
use crate::work::Parameters;

/// Overall state of one pipeline run.
///
/// Only the [`StateMachine`](crate::state::StateMachine) mutates a context.
/// Once `status` is terminal the machine rejects further changes, so clones
/// handed out after that point are final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub pipeline_id: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub parameters: Parameters,
    pub metrics: BTreeMap<String, f64>,
    /// First unrecoverable error (task name, attempt count and message).
    pub error: Option<String>,
}

impl ExecutionContext {
    pub fn new(execution_id: Uuid, pipeline_id: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            execution_id,
            pipeline_id: pipeline_id.into(),
            status: Status::Pending,
            started_at: Utc::now(),
            ended_at: None,
            parameters,
            metrics: BTreeMap::new(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }
}

/// One attempt of one task.
///
/// A retry never rewrites an earlier record; it appends a new `TaskRun`
/// with the next attempt number. Attempt `0` marks a task that was
/// cancelled before it was ever submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_name: TaskName,
    pub execution_id: Uuid,
    pub status: Status,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl TaskRun {
    pub(crate) fn pending(task_name: TaskName, execution_id: Uuid, attempt: u32) -> Self {
        Self {
            task_name,
            execution_id,
            status: Status::Pending,
            attempt,
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
        }
    }
}
