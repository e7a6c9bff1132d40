// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::state::RetryPolicy;
use crate::types::{BackendKind, ProcessingMode};

/// Top-level pipeline file as read from TOML, before validation.
///
/// ```toml
/// [pipeline]
/// name = "etl"
/// max_parallel_tasks = 4
///
/// [retry]
/// base_delay = "1s"
///
/// [default]
/// timeout = "5m"
///
/// [task.extract]
/// cmd = "echo '[1,2,3]'"
///
/// [task.load]
/// cmd = "cat"
/// after = ["extract"]
/// max_retries = 2
/// ```
///
/// All sections except the tasks are optional.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub executor: ExecutorSection,

    /// Defaults for `timeout` and `max_retries` from `[default]`.
    #[serde(default)]
    pub default: DefaultSection,

    /// All tasks from `[task.<name>]`, keyed by task name.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    #[serde(default)]
    pub processing_mode: ProcessingMode,

    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

fn default_max_parallel_tasks() -> usize {
    crate::engine::DEFAULT_MAX_PARALLEL_TASKS
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            processing_mode: ProcessingMode::default(),
            max_parallel_tasks: default_max_parallel_tasks(),
        }
    }
}

/// `[retry]` section. Durations use the `<n>ms|s|m|h` syntax.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_base_delay")]
    pub base_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_base_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "60s".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: true,
        }
    }
}

/// `[executor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default)]
    pub backend: BackendKind,

    /// Worker pool size for the distributed backend.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    4
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            workers: default_workers(),
        }
    }
}

/// `[default]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultSection {
    #[serde(default = "default_timeout")]
    pub timeout: String,

    #[serde(default)]
    pub max_retries: u32,
}

fn default_timeout() -> String {
    "5m".to_string()
}

impl Default for DefaultSection {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_retries: 0,
        }
    }
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// The shell command to execute.
    pub cmd: String,

    /// This task waits for every task listed here.
    #[serde(default)]
    pub after: Vec<String>,

    /// Overrides `default.timeout`.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Overrides `default.max_retries`.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// A task with its defaults applied and durations parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTask {
    pub cmd: String,
    pub after: Vec<String>,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// Validated configuration. Only constructed through
/// `TryFrom<RawConfigFile>`, so holders can rely on it describing a
/// buildable DAG.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub pipeline: PipelineSection,
    pub retry: RetryPolicy,
    pub executor: ExecutorSection,
    pub task: BTreeMap<String, ResolvedTask>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        pipeline: PipelineSection,
        retry: RetryPolicy,
        executor: ExecutorSection,
        task: BTreeMap<String, ResolvedTask>,
    ) -> Self {
        Self {
            pipeline,
            retry,
            executor,
            task,
        }
    }
}
