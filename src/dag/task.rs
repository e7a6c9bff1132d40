// src/dag/task.rs

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::work::TaskWork;

pub type TaskName = String;

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// A named unit of work plus the tasks that must succeed before it runs.
#[derive(Clone)]
pub struct Task {
    pub name: TaskName,
    pub dependencies: BTreeSet<TaskName>,
    pub work: Arc<dyn TaskWork>,
    pub timeout: Duration,
    /// Extra attempts after the first failure.
    pub max_retries: u32,
}

impl Task {
    pub fn new(name: impl Into<TaskName>, work: impl TaskWork + 'static) -> Self {
        Self::from_arc(name, Arc::new(work))
    }

    pub fn from_arc(name: impl Into<TaskName>, work: Arc<dyn TaskWork>) -> Self {
        Self {
            name: name.into(),
            dependencies: BTreeSet::new(),
            work,
            timeout: DEFAULT_TASK_TIMEOUT,
            max_retries: 0,
        }
    }

    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskName>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("work", &self.work.describe())
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
