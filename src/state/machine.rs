// src/state/machine.rs

//! The only writer of `ExecutionContext` and `TaskRun` records.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::dag::TaskName;
use crate::errors::{Result, RundagError, TaskError};
use crate::events::{EventSink, StateEvent};
use crate::state::{ExecutionContext, Status, TaskRun};
use crate::work::Parameters;

/// Applies status transitions for one execution.
///
/// Every transition is checked against [`Status::can_transition_to`] and
/// emitted to the configured [`EventSink`]. Task history is append-only:
/// `latest` indexes the newest `TaskRun` of each task inside `runs`.
#[derive(Debug)]
pub struct StateMachine {
    context: ExecutionContext,
    runs: Vec<TaskRun>,
    latest: HashMap<TaskName, usize>,
    sink: Arc<dyn EventSink>,
}

impl StateMachine {
    pub fn new(
        execution_id: Uuid,
        pipeline_id: impl Into<String>,
        parameters: Parameters,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            context: ExecutionContext::new(execution_id, pipeline_id, parameters),
            runs: Vec::new(),
            latest: HashMap::new(),
            sink,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.context.execution_id
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn task_runs(&self) -> &[TaskRun] {
        &self.runs
    }

    pub fn latest_run(&self, task: &str) -> Option<&TaskRun> {
        self.latest.get(task).map(|&idx| &self.runs[idx])
    }

    /// Number of attempts recorded for `task` (0 if it never became eligible).
    pub fn attempts_of(&self, task: &str) -> u32 {
        self.latest_run(task).map(|run| run.attempt).unwrap_or(0)
    }

    /// `pending -> running` for the execution.
    pub fn start(&mut self) -> Result<()> {
        self.transition_context(Status::Running, None)
    }

    /// Append a new `pending` TaskRun and return its attempt number.
    ///
    /// Allowed when the task has no history yet or its latest attempt is
    /// waiting in `retry`.
    pub fn open_attempt(&mut self, task: &str) -> Result<u32> {
        self.ensure_mutable()?;

        let attempt = match self.latest_run(task) {
            None => 1,
            Some(run) if run.status == Status::Retry => run.attempt + 1,
            Some(run) => {
                return Err(RundagError::InvalidTransition {
                    subject: format!("task '{task}' attempt {}", run.attempt + 1),
                    from: run.status,
                    to: Status::Pending,
                });
            }
        };

        self.push_run(TaskRun::pending(task.to_string(), self.execution_id(), attempt));
        Ok(attempt)
    }

    pub fn task_running(&mut self, task: &str) -> Result<()> {
        self.transition_task(task, Status::Running, |run| {
            run.started_at = Some(Utc::now());
        })
    }

    pub fn task_succeeded(&mut self, task: &str, output: Value) -> Result<()> {
        self.transition_task(task, Status::Success, |run| {
            run.ended_at = Some(Utc::now());
            run.output = Some(output);
        })
    }

    pub fn task_failed(&mut self, task: &str, error: &TaskError) -> Result<()> {
        let message = error.to_string();
        self.transition_task(task, Status::Failed, |run| {
            run.ended_at = Some(Utc::now());
            run.error = Some(message);
        })
    }

    /// `failed -> retry`. The next attempt is opened with [`open_attempt`].
    ///
    /// [`open_attempt`]: StateMachine::open_attempt
    pub fn task_retrying(&mut self, task: &str) -> Result<()> {
        self.transition_task(task, Status::Retry, |_| {})
    }

    /// Mark a task `cancelled`.
    ///
    /// - no history: appends attempt `0` as `pending -> cancelled`
    /// - waiting for a retry: appends the next attempt as `pending -> cancelled`
    /// - pending or running: transitions the latest attempt
    pub fn task_cancelled(&mut self, task: &str) -> Result<()> {
        self.ensure_mutable()?;

        match self.latest_run(task).map(|run| (run.status, run.attempt)) {
            None => {
                self.push_run(TaskRun::pending(task.to_string(), self.execution_id(), 0));
            }
            Some((Status::Retry, attempt)) => {
                self.push_run(TaskRun::pending(
                    task.to_string(),
                    self.execution_id(),
                    attempt + 1,
                ));
            }
            Some(_) => {}
        }

        self.transition_task(task, Status::Cancelled, |run| {
            run.ended_at = Some(Utc::now());
        })
    }

    pub fn record_metric(&mut self, key: &str, value: f64) -> Result<()> {
        self.ensure_mutable()?;
        self.context.metrics.insert(key.to_string(), value);
        Ok(())
    }

    /// Move the execution to its terminal status and return the final context.
    pub fn finish(&mut self, status: Status, error: Option<String>) -> Result<ExecutionContext> {
        if !status.is_terminal() {
            return Err(RundagError::InvalidTransition {
                subject: "execution".to_string(),
                from: self.context.status,
                to: status,
            });
        }
        self.transition_context(status, error)?;
        Ok(self.context.clone())
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.context.is_terminal() {
            return Err(RundagError::InvalidTransition {
                subject: format!("execution {}", self.context.execution_id),
                from: self.context.status,
                to: self.context.status,
            });
        }
        Ok(())
    }

    fn transition_context(&mut self, to: Status, error: Option<String>) -> Result<()> {
        let from = self.context.status;
        if !from.can_transition_to(to) {
            return Err(RundagError::InvalidTransition {
                subject: "execution".to_string(),
                from,
                to,
            });
        }

        self.context.status = to;
        if to.is_terminal() {
            self.context.ended_at = Some(Utc::now());
            self.context.error = error;
        }

        debug!(execution_id = %self.context.execution_id, %from, %to, "execution transition");

        self.sink.emit(&StateEvent {
            execution_id: self.context.execution_id,
            task_name: None,
            attempt: 0,
            status: to,
            started_at: Some(self.context.started_at),
            ended_at: self.context.ended_at,
            error: self.context.error.clone(),
        });
        Ok(())
    }

    fn transition_task(
        &mut self,
        task: &str,
        to: Status,
        update: impl FnOnce(&mut TaskRun),
    ) -> Result<()> {
        self.ensure_mutable()?;

        let idx = *self
            .latest
            .get(task)
            .ok_or_else(|| RundagError::TaskNotFound(task.to_string()))?;
        let run = &mut self.runs[idx];

        if !run.status.can_transition_to(to) {
            return Err(RundagError::InvalidTransition {
                subject: format!("task '{}' attempt {}", run.task_name, run.attempt),
                from: run.status,
                to,
            });
        }

        let from = run.status;
        run.status = to;
        update(run);

        debug!(task = %run.task_name, attempt = run.attempt, %from, %to, "task transition");

        let event = StateEvent {
            execution_id: run.execution_id,
            task_name: Some(run.task_name.clone()),
            attempt: run.attempt,
            status: to,
            started_at: run.started_at,
            ended_at: run.ended_at,
            error: run.error.clone(),
        };
        self.sink.emit(&event);
        Ok(())
    }

    fn push_run(&mut self, run: TaskRun) {
        let event = StateEvent {
            execution_id: run.execution_id,
            task_name: Some(run.task_name.clone()),
            attempt: run.attempt,
            status: run.status,
            started_at: None,
            ended_at: None,
            error: None,
        };
        self.latest.insert(run.task_name.clone(), self.runs.len());
        self.runs.push(run);
        self.sink.emit(&event);
    }
}
