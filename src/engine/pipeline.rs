// src/engine/pipeline.rs

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::dag::{Dag, Task, TaskName};
use crate::engine::runner::{RunControl, RunLoop, RunReport};
use crate::errors::Result;
use crate::events::{EventSink, TracingSink};
use crate::exec::{Executor, LocalExecutor};
use crate::state::{RetryController, RetryPolicy, StateMachine};
use crate::types::ProcessingMode;
use crate::work::{
    Connector, DestinationConfig, Parameters, SinkWork, SourceConfig, SourceWork, TransformWork,
    Transformation,
};

pub const DEFAULT_MAX_PARALLEL_TASKS: usize = 4;

/// A named set of tasks plus the settings every execution of it shares.
///
/// Each call to [`Pipeline::execute`] validates the tasks into a [`Dag`]
/// and produces one `ExecutionContext`.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub processing_mode: ProcessingMode,
    pub max_parallel_tasks: usize,
    pub retry: RetryPolicy,
    tasks: Vec<Task>,
    sink: Arc<dyn EventSink>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            processing_mode: ProcessingMode::default(),
            max_parallel_tasks: DEFAULT_MAX_PARALLEL_TASKS,
            retry: RetryPolicy::default(),
            tasks: Vec::new(),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_processing_mode(mut self, mode: ProcessingMode) -> Self {
        self.processing_mode = mode;
        self
    }

    pub fn with_max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn add_task(&mut self, task: Task) -> &mut Self {
        self.tasks.push(task);
        self
    }

    /// Add a `source_<name>` task with no dependencies.
    pub fn add_source(
        &mut self,
        name: &str,
        connector: Arc<dyn Connector>,
        source: SourceConfig,
    ) -> &mut Self {
        let task = Task::new(format!("source_{name}"), SourceWork::new(connector, source));
        self.add_task(task)
    }

    /// Add a `transform_<name>` task depending on the last added task.
    pub fn add_transformation(
        &mut self,
        name: &str,
        transformation: Arc<dyn Transformation>,
    ) -> &mut Self {
        let task = Task::new(format!("transform_{name}"), TransformWork::new(transformation))
            .after(self.last_task());
        self.add_task(task)
    }

    /// Add a `sink_<name>` task depending on the last added task.
    pub fn add_sink(
        &mut self,
        name: &str,
        connector: Arc<dyn Connector>,
        destination: DestinationConfig,
    ) -> &mut Self {
        let task = Task::new(format!("sink_{name}"), SinkWork::new(connector, destination))
            .after(self.last_task());
        self.add_task(task)
    }

    fn last_task(&self) -> Option<TaskName> {
        self.tasks.last().map(|t| t.name.clone())
    }

    pub fn build_dag(&self) -> Result<Dag> {
        Dag::build(self.tasks.clone())
    }

    /// Run once on an in-process pool of `max_parallel_tasks` workers.
    pub async fn execute_local(&self, parameters: Parameters) -> Result<RunReport> {
        let mut executor = LocalExecutor::new(self.max_parallel_tasks);
        self.execute(parameters, &mut executor).await
    }

    pub async fn execute(
        &self,
        parameters: Parameters,
        executor: &mut dyn Executor,
    ) -> Result<RunReport> {
        self.execute_with(parameters, executor, RunControl::new())
            .await
    }

    /// Run once with caller-provided cancel token and status channel.
    ///
    /// DAG validation errors are returned before any task is submitted.
    pub async fn execute_with(
        &self,
        mut parameters: Parameters,
        executor: &mut dyn Executor,
        control: RunControl,
    ) -> Result<RunReport> {
        let dag = self.build_dag()?;

        parameters
            .entry("processing_mode".to_string())
            .or_insert_with(|| Value::String(self.processing_mode.as_str().to_string()));

        let machine = StateMachine::new(
            control.execution_id,
            self.id.clone(),
            parameters,
            self.sink.clone(),
        );

        RunLoop::new(
            &dag,
            executor,
            machine,
            RetryController::new(self.retry),
            self.max_parallel_tasks,
            control,
        )
        .run()
        .await
    }
}
