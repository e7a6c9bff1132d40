// src/exec/local.rs

//! In-process executor backed by a bounded pool of tokio tasks.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, RundagError, TaskError};
use crate::exec::{BoxFuture, Completion, Executor, Job, TaskHandle};
use crate::work::WorkContext;

/// Internal handle for a dispatched attempt.
///
/// - `cancel` is handed to the work as its cancellation token.
/// - `handle` is the tokio task running it, aborted on drop of the executor.
struct ActiveTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs each job in its own tokio task, at most `capacity` at a time.
///
/// The permit of a job is released before its completion is published, so
/// a caller that saw a completion can always submit again without waiting.
pub struct LocalExecutor {
    permits: Arc<Semaphore>,
    capacity: usize,
    active: HashMap<TaskHandle, ActiveTask>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl std::fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.active.len())
            .finish()
    }
}

impl LocalExecutor {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: HashMap::new(),
            tx,
            rx,
        }
    }
}

impl Executor for LocalExecutor {
    fn submit(&mut self, job: Job) -> BoxFuture<'_, Result<TaskHandle>> {
        Box::pin(async move {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| RundagError::Executor(format!("worker pool closed: {e}")))?;

            let key = job.key.clone();
            let cancel = CancellationToken::new();
            let tx = self.tx.clone();

            let ctx = WorkContext {
                execution_id: key.execution_id,
                task: key.task.clone(),
                attempt: key.attempt,
                inputs: job.inputs,
                parameters: job.parameters,
                cancel: cancel.clone(),
            };
            let work = job.work;
            let timeout = job.timeout;
            let run_key = key.clone();
            let run_cancel = cancel.clone();

            debug!(task = %key.task, attempt = key.attempt, ?timeout, "dispatching job locally");

            let handle = tokio::spawn(async move {
                let fut = AssertUnwindSafe(work.run(ctx)).catch_unwind();
                let result = match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => {
                        warn!(task = %run_key.task, attempt = run_key.attempt, "task work panicked");
                        Err(TaskError::Failure(format!(
                            "task panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    }
                    Err(_) => {
                        run_cancel.cancel();
                        info!(task = %run_key.task, attempt = run_key.attempt, ?timeout, "task timed out");
                        Err(TaskError::Timeout(timeout))
                    }
                };

                drop(permit);
                if tx.send(Completion::new(run_key, result)).is_err() {
                    debug!("local executor dropped; discarding completion");
                }
            });

            self.active.insert(key.clone(), ActiveTask { cancel, handle });
            Ok(key)
        })
    }

    fn await_any(&mut self) -> BoxFuture<'_, Option<Completion>> {
        Box::pin(async move {
            while !self.active.is_empty() {
                let completion = self.rx.recv().await?;
                if self.active.remove(&completion.handle).is_some() {
                    return Some(completion);
                }
                debug!(handle = %completion.handle, "dropping completion for unknown handle");
            }
            None
        })
    }

    fn cancel(&mut self, handle: &TaskHandle) {
        if let Some(active) = self.active.get(handle) {
            debug!(%handle, "cancelling local job");
            active.cancel.cancel();
        }
    }

    fn in_flight(&self) -> usize {
        self.active.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

impl Drop for LocalExecutor {
    fn drop(&mut self) {
        for (_, active) in self.active.drain() {
            active.cancel.cancel();
            active.handle.abort();
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};
    use uuid::Uuid;

    use super::*;
    use crate::exec::RunKey;
    use crate::work::{Parameters, TaskInput, work_fn};

    fn job(task: &str, work: impl crate::work::TaskWork + 'static, timeout: Duration) -> Job {
        Job {
            key: RunKey {
                execution_id: Uuid::nil(),
                task: task.to_string(),
                attempt: 1,
            },
            work: Arc::new(work),
            inputs: TaskInput::new(),
            parameters: Parameters::new(),
            timeout,
        }
    }

    #[tokio::test]
    async fn returns_none_when_idle() {
        let mut exec = LocalExecutor::new(2);
        assert!(exec.await_any().await.is_none());
    }

    #[tokio::test]
    async fn panicking_work_becomes_a_failure() {
        let mut exec = LocalExecutor::new(1);
        exec.submit(job(
            "boom",
            work_fn(|ctx: WorkContext| async move {
                if ctx.attempt > 0 {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            }),
            Duration::from_secs(5),
        ))
        .await
        .unwrap();

        let done = exec.await_any().await.unwrap();
        match done.result {
            Err(TaskError::Failure(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(exec.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_work_times_out() {
        let mut exec = LocalExecutor::new(1);
        exec.submit(job(
            "slow",
            work_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
            Duration::from_secs(1),
        ))
        .await
        .unwrap();

        let done = exec.await_any().await.unwrap();
        assert_eq!(done.result, Err(TaskError::Timeout(Duration::from_secs(1))));
    }

    #[tokio::test]
    async fn cancel_reaches_the_work() {
        let mut exec = LocalExecutor::new(1);
        let handle = exec
            .submit(job(
                "waits",
                work_fn(|ctx| async move {
                    ctx.cancel.cancelled().await;
                    Err(TaskError::Cancelled)
                }),
                Duration::from_secs(30),
            ))
            .await
            .unwrap();

        exec.cancel(&handle);
        let done = exec.await_any().await.unwrap();
        assert_eq!(done.handle, handle);
        assert_eq!(done.result, Err(TaskError::Cancelled));
    }

    #[tokio::test]
    async fn outputs_are_delivered() {
        let mut exec = LocalExecutor::new(2);
        exec.submit(job("a", work_fn(|_| async { Ok(json!(1)) }), Duration::from_secs(5)))
            .await
            .unwrap();
        let done = exec.await_any().await.unwrap();
        assert_eq!(done.result, Ok(json!(1)));
    }
}
