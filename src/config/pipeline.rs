// src/config/pipeline.rs

use std::sync::Arc;

use crate::config::model::ConfigFile;
use crate::dag::Task;
use crate::engine::Pipeline;
use crate::events::EventSink;
use crate::exec::WorkRegistry;
use crate::work::CommandWork;

impl ConfigFile {
    /// One [`CommandWork`] task per `[task.<name>]` section.
    pub fn tasks(&self) -> Vec<Task> {
        self.task
            .iter()
            .map(|(name, t)| {
                Task::new(name.clone(), CommandWork::new(t.cmd.clone()))
                    .after(t.after.iter().cloned())
                    .with_timeout(t.timeout)
                    .with_max_retries(t.max_retries)
            })
            .collect()
    }

    pub fn build_pipeline(&self, sink: Arc<dyn EventSink>) -> Pipeline {
        let mut pipeline = Pipeline::new(self.pipeline.name.clone())
            .with_id(self.pipeline.name.clone())
            .with_processing_mode(self.pipeline.processing_mode)
            .with_max_parallel_tasks(self.pipeline.max_parallel_tasks)
            .with_retry_policy(self.retry)
            .with_event_sink(sink);
        for task in self.tasks() {
            pipeline.add_task(task);
        }
        pipeline
    }

    /// Registry for distributed workers running this file's commands.
    pub fn work_registry(&self) -> WorkRegistry {
        let mut registry = WorkRegistry::new();
        for task in self.tasks() {
            registry.register(task.name.clone(), task.work.clone());
        }
        registry
    }
}
