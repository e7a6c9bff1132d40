#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rundag::errors::TaskError;
use rundag::work::{
    Ack, Connector, DestinationConfig, Parameters, Rows, SourceConfig, TaskInput, TaskWork,
    Transformation, WorkContext,
};
use serde_json::{Value, json};

/// One observed call of a [`RecordingWork`].
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub task: String,
    pub attempt: u32,
    pub inputs: TaskInput,
}

/// Shared log of invocations across several works, in start order.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Invocation>>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn order(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.task).collect()
    }

    pub fn attempts_of(&self, task: &str) -> usize {
        self.calls().iter().filter(|c| c.task == task).count()
    }

    /// Highest number of works that were running at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn enter(&self, ctx: &WorkContext) {
        self.calls.lock().unwrap().push(Invocation {
            task: ctx.task.clone(),
            attempt: ctx.attempt,
            inputs: ctx.inputs.clone(),
        });
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Records each call, optionally sleeps, then returns `output` (defaults to
/// the task name as a JSON string).
#[derive(Debug, Clone)]
pub struct RecordingWork {
    log: CallLog,
    delay: Option<Duration>,
    output: Option<Value>,
}

impl RecordingWork {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            delay: None,
            output: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

#[async_trait]
impl TaskWork for RecordingWork {
    async fn run(&self, ctx: WorkContext) -> Result<Value, TaskError> {
        self.log.enter(&ctx);
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => {
                    self.log.exit();
                    return Err(TaskError::Cancelled);
                }
            }
        }
        self.log.exit();
        Ok(self
            .output
            .clone()
            .unwrap_or_else(|| Value::String(ctx.task.clone())))
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

/// Fails the first `failures` attempts, then succeeds with `{"attempt": n}`.
#[derive(Debug, Clone)]
pub struct ScriptedWork {
    log: CallLog,
    failures: u32,
}

impl ScriptedWork {
    pub fn failing(log: &CallLog, failures: u32) -> Self {
        Self {
            log: log.clone(),
            failures,
        }
    }

    pub fn always_failing(log: &CallLog) -> Self {
        Self::failing(log, u32::MAX)
    }
}

#[async_trait]
impl TaskWork for ScriptedWork {
    async fn run(&self, ctx: WorkContext) -> Result<Value, TaskError> {
        self.log.enter(&ctx);
        self.log.exit();
        if ctx.attempt <= self.failures {
            return Err(TaskError::Failure(format!(
                "{} failed on attempt {}",
                ctx.task, ctx.attempt
            )));
        }
        Ok(json!({ "attempt": ctx.attempt }))
    }

    fn describe(&self) -> String {
        format!("scripted ({} failures)", self.failures)
    }
}

/// Waits until cancelled (or `limit` elapses) and reports the cancellation.
#[derive(Debug, Clone)]
pub struct BlockingWork {
    log: CallLog,
    limit: Duration,
}

impl BlockingWork {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            limit: Duration::from_secs(3600),
        }
    }
}

#[async_trait]
impl TaskWork for BlockingWork {
    async fn run(&self, ctx: WorkContext) -> Result<Value, TaskError> {
        self.log.enter(&ctx);
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(TaskError::Cancelled),
            _ = tokio::time::sleep(self.limit) => Ok(Value::Null),
        };
        self.log.exit();
        result
    }
}

/// Panics on the first `panics` attempts, then returns `null`. Used to
/// crash distributed workers.
#[derive(Debug, Clone)]
pub struct PanickingWork {
    panics: u32,
}

impl PanickingWork {
    pub fn first_attempts(panics: u32) -> Self {
        Self { panics }
    }
}

#[async_trait]
impl TaskWork for PanickingWork {
    async fn run(&self, ctx: WorkContext) -> Result<Value, TaskError> {
        if ctx.attempt <= self.panics {
            panic!("{} blew up on attempt {}", ctx.task, ctx.attempt);
        }
        Ok(Value::Null)
    }
}

/// In-memory connector: `read` returns the seeded rows, `write` appends.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    rows: Rows,
    written: Arc<Mutex<Rows>>,
}

impl MemoryConnector {
    pub fn with_rows(rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        Self {
            rows,
            written: Arc::default(),
        }
    }

    pub fn written(&self) -> Rows {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn read(&self, _source: &SourceConfig) -> anyhow::Result<Rows> {
        Ok(self.rows.clone())
    }

    async fn write(&self, rows: Rows, _destination: &DestinationConfig) -> anyhow::Result<Ack> {
        let n = rows.len();
        self.written.lock().unwrap().extend(rows);
        Ok(Ack { rows_written: n })
    }
}

/// Multiplies the numeric field `field` by the `factor` parameter (default 1).
#[derive(Debug, Clone)]
pub struct ScaleField {
    pub field: String,
}

impl Transformation for ScaleField {
    fn apply(&self, rows: Rows, parameters: &Parameters) -> anyhow::Result<Rows> {
        let factor = parameters.get("factor").and_then(Value::as_i64).unwrap_or(1);
        rows.into_iter()
            .map(|mut row| {
                let n = row
                    .get(&self.field)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| anyhow::anyhow!("row has no numeric '{}'", self.field))?;
                row.insert(self.field.clone(), json!(n * factor));
                Ok(row)
            })
            .collect()
    }
}
