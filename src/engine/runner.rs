// src/engine/runner.rs

//! The execution control loop.
//!
//! A single task owns every piece of run state (`completed`, `in_flight`,
//! retry timers, outputs) and is the only caller of the state machine. It
//! suspends in exactly one place: a `select!` over the cancel token, the
//! executor's next completion and the retry timer queue.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::poll_fn;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dag::{Dag, TaskName, blocked_by, ordered_eligible};
use crate::errors::{Result, RundagError, TaskError};
use crate::exec::{Completion, Executor, Job, RunKey, TaskHandle};
use crate::state::{ExecutionContext, RetryController, StateMachine, Status, TaskRun};
use crate::work::{Parameters, TaskInput};

/// Outside handles on a run: its id, a cancel token and an optional
/// channel receiving a context snapshot after every step.
#[derive(Debug, Clone)]
pub struct RunControl {
    pub execution_id: Uuid,
    pub cancel: CancellationToken,
    pub status: Option<watch::Sender<ExecutionContext>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            status: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_status(mut self, status: watch::Sender<ExecutionContext>) -> Self {
        self.status = Some(status);
        self
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub context: ExecutionContext,
    /// Every attempt of every task, in the order they were opened.
    pub task_runs: Vec<TaskRun>,
    /// Outputs of the tasks that succeeded.
    pub outputs: BTreeMap<TaskName, Value>,
}

impl RunReport {
    pub fn status(&self) -> Status {
        self.context.status
    }

    pub fn runs_for<'a>(&'a self, task: &'a str) -> impl Iterator<Item = &'a TaskRun> + 'a {
        self.task_runs.iter().filter(move |r| r.task_name == task)
    }

    /// Attempts that reached the executor.
    pub fn attempts_of(&self, task: &str) -> usize {
        self.runs_for(task).filter(|r| r.attempt > 0).count()
    }

    pub fn final_status_of(&self, task: &str) -> Option<Status> {
        self.runs_for(task).last().map(|r| r.status)
    }
}

enum Step {
    Cancel,
    Completed(Option<Completion>),
    RetryDue(Option<delay_queue::Expired<TaskName>>),
}

pub struct RunLoop<'a> {
    dag: &'a Dag,
    executor: &'a mut dyn Executor,
    machine: StateMachine,
    retry: RetryController,
    max_parallel: usize,
    parameters: Parameters,
    cancel: CancellationToken,
    status_tx: Option<watch::Sender<ExecutionContext>>,

    completed: BTreeSet<TaskName>,
    in_flight: BTreeSet<TaskName>,
    handles: HashMap<TaskName, TaskHandle>,
    waiting_retry: HashMap<TaskName, delay_queue::Key>,
    retries: DelayQueue<TaskName>,
    failed: BTreeSet<TaskName>,
    cancelled_tasks: BTreeSet<TaskName>,
    outputs: BTreeMap<TaskName, Value>,

    first_failure: Option<String>,
    cancelled: bool,
    attempts: u32,
    retried: u32,
}

impl<'a> RunLoop<'a> {
    pub fn new(
        dag: &'a Dag,
        executor: &'a mut dyn Executor,
        machine: StateMachine,
        retry: RetryController,
        max_parallel: usize,
        control: RunControl,
    ) -> Self {
        let parameters = machine.context().parameters.clone();
        Self {
            dag,
            executor,
            machine,
            retry,
            max_parallel: max_parallel.max(1),
            parameters,
            cancel: control.cancel,
            status_tx: control.status,
            completed: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            handles: HashMap::new(),
            waiting_retry: HashMap::new(),
            retries: DelayQueue::new(),
            failed: BTreeSet::new(),
            cancelled_tasks: BTreeSet::new(),
            outputs: BTreeMap::new(),
            first_failure: None,
            cancelled: false,
            attempts: 0,
            retried: 0,
        }
    }

    pub async fn run(mut self) -> Result<RunReport> {
        let started = Instant::now();
        let execution_id = self.machine.execution_id();
        info!(
            %execution_id,
            tasks = self.dag.len(),
            executor = self.executor.name(),
            max_parallel = self.max_parallel,
            "execution started"
        );

        self.machine.start()?;
        self.publish();

        loop {
            if !self.cancelled && self.cancel.is_cancelled() {
                self.on_cancel();
            }
            if !self.cancelled {
                self.dispatch_ready().await?;
            }

            let retries_pending = !self.cancelled && !self.retries.is_empty();
            if self.in_flight.is_empty() && !retries_pending {
                break;
            }

            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !self.cancelled => Step::Cancel,
                done = self.executor.await_any(), if !self.in_flight.is_empty() => Step::Completed(done),
                due = poll_fn(|cx| self.retries.poll_expired(cx)), if retries_pending => Step::RetryDue(due),
            };

            match step {
                Step::Cancel => self.on_cancel(),
                Step::Completed(Some(done)) => self.on_completion(done)?,
                Step::Completed(None) => self.on_executor_lost()?,
                Step::RetryDue(Some(expired)) => {
                    let task = expired.into_inner();
                    self.waiting_retry.remove(&task);
                    debug!(task = %task, "retry delay elapsed");
                }
                Step::RetryDue(None) => {}
            }
            self.publish();
        }

        self.finalize(started)
    }

    /// Submit as many eligible tasks as free capacity allows, in order-hint
    /// order.
    async fn dispatch_ready(&mut self) -> Result<()> {
        let limit = self.max_parallel.min(self.executor.capacity());
        let free = limit.saturating_sub(self.in_flight.len());
        if free == 0 {
            return Ok(());
        }

        let mut busy = self.in_flight.clone();
        busy.extend(self.waiting_retry.keys().cloned());
        busy.extend(self.failed.iter().cloned());
        busy.extend(self.cancelled_tasks.iter().cloned());

        let ready = ordered_eligible(self.dag, &self.completed, &busy);
        for task in ready.into_iter().take(free) {
            self.submit(task).await?;
        }
        Ok(())
    }

    async fn submit(&mut self, task: TaskName) -> Result<()> {
        let task_def = self
            .dag
            .task(&task)
            .ok_or_else(|| RundagError::TaskNotFound(task.clone()))?;

        let attempt = self.machine.open_attempt(&task)?;
        self.machine.task_running(&task)?;
        self.attempts += 1;

        let inputs: TaskInput = task_def
            .dependencies
            .iter()
            .filter_map(|dep| self.outputs.get(dep).map(|v| (dep.clone(), v.clone())))
            .collect();

        let job = Job {
            key: RunKey {
                execution_id: self.machine.execution_id(),
                task: task.clone(),
                attempt,
            },
            work: task_def.work.clone(),
            inputs,
            parameters: self.parameters.clone(),
            timeout: task_def.timeout,
        };

        info!(task = %task, attempt, "submitting task");
        match self.executor.submit(job).await {
            Ok(handle) => {
                self.in_flight.insert(task.clone());
                self.handles.insert(task, handle);
                Ok(())
            }
            Err(e) => {
                error!(task = %task, attempt, error = %e, "executor rejected task");
                self.on_failure(&task, attempt, TaskError::Failure(e.to_string()))
            }
        }
    }

    fn on_completion(&mut self, done: Completion) -> Result<()> {
        let task = done.handle.task.clone();
        if self.handles.get(&task) != Some(&done.handle) {
            debug!(handle = %done.handle, "ignoring completion for stale handle");
            return Ok(());
        }
        self.handles.remove(&task);
        self.in_flight.remove(&task);

        let attempt = done.handle.attempt;
        match done.result {
            Ok(output) => {
                info!(task = %task, attempt, "task succeeded");
                self.machine.task_succeeded(&task, output.clone())?;
                self.outputs.insert(task.clone(), output);
                self.completed.insert(task);
                Ok(())
            }
            // Only a run-level cancel makes a task `cancelled`; work that
            // gives up on its own has failed.
            Err(TaskError::Cancelled) if self.cancelled => {
                info!(task = %task, attempt, "task cancelled");
                self.machine.task_cancelled(&task)?;
                self.cancelled_tasks.insert(task);
                Ok(())
            }
            Err(err) => self.on_failure(&task, attempt, err),
        }
    }

    fn on_failure(&mut self, task: &str, attempt: u32, err: TaskError) -> Result<()> {
        self.machine.task_failed(task, &err)?;

        let task_def = self
            .dag
            .task(task)
            .ok_or_else(|| RundagError::TaskNotFound(task.to_string()))?;

        if !self.cancelled && err.is_retryable() && self.retry.should_retry(task_def, attempt) {
            let delay = self.retry.delay_for(attempt);
            warn!(task = %task, attempt, error = %err, ?delay, "task failed; scheduling retry");
            self.machine.task_retrying(task)?;
            let key = self.retries.insert(task.to_string(), delay);
            self.waiting_retry.insert(task.to_string(), key);
            self.retried += 1;
            return Ok(());
        }

        error!(task = %task, attempt, error = %err, "task failed permanently");
        self.failed.insert(task.to_string());
        if self.first_failure.is_none() {
            self.first_failure = Some(format!(
                "task '{task}' failed after {attempt} attempt(s): {err}"
            ));
        }

        let blocked = self.dag.descendants_of(task);
        if !blocked.is_empty() {
            info!(task = %task, blocked = ?blocked, "blocking dependents of failed task");
        }
        Ok(())
    }

    fn on_cancel(&mut self) {
        info!(
            execution_id = %self.machine.execution_id(),
            in_flight = self.in_flight.len(),
            waiting_retry = self.waiting_retry.len(),
            "cancellation requested; draining in-flight tasks"
        );
        self.cancelled = true;
        for handle in self.handles.values() {
            self.executor.cancel(handle);
        }
        self.retries.clear();
    }

    /// The executor reported nothing in flight while the loop still expects
    /// completions. Fail the orphaned attempts rather than wait forever.
    fn on_executor_lost(&mut self) -> Result<()> {
        error!(
            executor = self.executor.name(),
            orphaned = self.in_flight.len(),
            "executor lost track of in-flight tasks"
        );
        let orphaned: Vec<TaskName> = std::mem::take(&mut self.in_flight).into_iter().collect();
        for task in orphaned {
            let attempt = self
                .handles
                .remove(&task)
                .map(|h| h.attempt)
                .unwrap_or_else(|| self.machine.attempts_of(&task));
            self.on_failure(&task, attempt, TaskError::failure("lost by executor"))?;
        }
        Ok(())
    }

    fn finalize(mut self, started: Instant) -> Result<RunReport> {
        let blocked = blocked_by(self.dag, &self.failed);
        for task in self.dag.order_hint() {
            if self.completed.contains(task)
                || self.failed.contains(task)
                || self.cancelled_tasks.contains(task)
            {
                continue;
            }
            self.machine.task_cancelled(task)?;
            self.cancelled_tasks.insert(task.clone());
        }

        let metrics = [
            ("tasks_total", self.dag.len() as f64),
            ("tasks_succeeded", self.completed.len() as f64),
            ("tasks_failed", self.failed.len() as f64),
            ("tasks_cancelled", self.cancelled_tasks.len() as f64),
            ("tasks_blocked", blocked.len() as f64),
            ("task_attempts", self.attempts as f64),
            ("retries", self.retried as f64),
            ("duration_ms", started.elapsed().as_millis() as f64),
        ];
        for (key, value) in metrics {
            self.machine.record_metric(key, value)?;
        }

        let (status, error) = if self.cancelled {
            (Status::Cancelled, Some("execution cancelled".to_string()))
        } else if let Some(failure) = self.first_failure.take() {
            (Status::Failed, Some(failure))
        } else {
            (Status::Success, None)
        };

        let context = self.machine.finish(status, error)?;
        self.publish();

        info!(
            execution_id = %context.execution_id,
            status = %context.status,
            succeeded = self.completed.len(),
            failed = self.failed.len(),
            blocked = blocked.len(),
            cancelled = self.cancelled_tasks.len(),
            "execution finished"
        );

        Ok(RunReport {
            context,
            task_runs: self.machine.task_runs().to_vec(),
            outputs: self.outputs,
        })
    }

    fn publish(&self) {
        if let Some(tx) = &self.status_tx {
            tx.send_replace(self.machine.context().clone());
        }
    }
}
