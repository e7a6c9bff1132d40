#![allow(dead_code)]

use std::collections::BTreeMap;

use rundag::config::{
    ConfigFile, DefaultSection, ExecutorSection, PipelineSection, RawConfigFile, RetrySection,
    TaskConfig,
};
use rundag::dag::Task;
use rundag::types::BackendKind;
use rundag::work::work_fn;
use serde_json::Value;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                pipeline: PipelineSection::default(),
                retry: RetrySection::default(),
                executor: ExecutorSection::default(),
                default: DefaultSection::default(),
                task: BTreeMap::new(),
            },
        }
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.config.task.insert(name.to_string(), task);
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.config.pipeline.name = name.to_string();
        self
    }

    pub fn with_max_parallel_tasks(mut self, n: usize) -> Self {
        self.config.pipeline.max_parallel_tasks = n;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind, workers: usize) -> Self {
        self.config.executor.backend = backend;
        self.config.executor.workers = workers;
        self
    }

    /// Tiny delays without jitter, so retry tests stay fast and exact.
    pub fn with_fast_retries(mut self) -> Self {
        self.config.retry.base_delay = "10ms".to_string();
        self.config.retry.max_delay = "50ms".to_string();
        self.config.retry.jitter = false;
        self
    }

    pub fn with_default_timeout(mut self, timeout: &str) -> Self {
        self.config.default.timeout = timeout.to_string();
        self
    }

    pub fn with_default_max_retries(mut self, n: u32) -> Self {
        self.config.default.max_retries = n;
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            task: TaskConfig {
                cmd: cmd.to_string(),
                after: vec![],
                timeout: None,
                max_retries: None,
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.task.timeout = Some(timeout.to_string());
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.task.max_retries = Some(n);
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

/// A task whose work returns `null` immediately.
pub fn noop_task(name: &str, deps: &[&str]) -> Task {
    Task::new(name, work_fn(|_| async { Ok(Value::Null) })).after(deps.iter().copied())
}
