use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rundag::errors::Result;
use rundag::exec::{BoxFuture, Completion, Executor, Job, TaskHandle};
use rundag::work::WorkContext;
use tokio_util::sync::CancellationToken;

/// A fake executor that:
/// - records which tasks were submitted, in order
/// - runs each job to completion inline during `submit`
/// - hands completions back in submission order.
///
/// Timeouts are not enforced; keep fake work fast.
pub struct FakeExecutor {
    capacity: usize,
    submitted: Arc<Mutex<Vec<TaskHandle>>>,
    ready: VecDeque<Completion>,
}

impl FakeExecutor {
    pub fn new(capacity: usize, submitted: Arc<Mutex<Vec<TaskHandle>>>) -> Self {
        Self {
            capacity,
            submitted,
            ready: VecDeque::new(),
        }
    }
}

impl Executor for FakeExecutor {
    fn submit(&mut self, job: Job) -> BoxFuture<'_, Result<TaskHandle>> {
        Box::pin(async move {
            self.submitted.lock().unwrap().push(job.key.clone());

            let ctx = WorkContext {
                execution_id: job.key.execution_id,
                task: job.key.task.clone(),
                attempt: job.key.attempt,
                inputs: job.inputs,
                parameters: job.parameters,
                cancel: CancellationToken::new(),
            };
            let result = job.work.run(ctx).await;
            self.ready.push_back(Completion::new(job.key.clone(), result));
            Ok(job.key)
        })
    }

    fn await_any(&mut self) -> BoxFuture<'_, Option<Completion>> {
        Box::pin(async move { self.ready.pop_front() })
    }

    fn cancel(&mut self, _handle: &TaskHandle) {}

    fn in_flight(&self) -> usize {
        self.ready.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
