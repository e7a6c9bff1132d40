// src/exec/worker.rs

//! Workers draining a [`WorkQueue`](crate::exec::WorkQueue).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::{Dag, TaskName};
use crate::errors::TaskError;
use crate::exec::RunKey;
use crate::exec::queue::{ControlMessage, WorkItem, WorkerEndpoint, WorkerMessage};
use crate::work::{TaskWork, WorkContext};

/// Task name to work lookup used by workers.
#[derive(Clone, Default)]
pub struct WorkRegistry {
    works: HashMap<TaskName, Arc<dyn TaskWork>>,
}

impl std::fmt::Debug for WorkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRegistry")
            .field("tasks", &self.works.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dag(dag: &Dag) -> Self {
        let works = dag
            .tasks()
            .map(|t| (t.name.clone(), t.work.clone()))
            .collect();
        Self { works }
    }

    pub fn register(&mut self, task: impl Into<TaskName>, work: Arc<dyn TaskWork>) {
        self.works.insert(task.into(), work);
    }

    pub fn get(&self, task: &str) -> Option<Arc<dyn TaskWork>> {
        self.works.get(task).cloned()
    }
}

/// How many broadcast cancels a worker remembers for items it has not
/// dequeued yet.
const REMEMBERED_CANCELS: usize = 1024;

/// Cancelled keys seen on the control channel, oldest evicted first.
///
/// Most keys belong to items another worker owns or the executor already
/// reaped, so the set is bounded. Forgetting a key is harmless: the
/// executor has already completed that handle and drops whatever the
/// worker reports for it.
#[derive(Debug)]
struct CancelledKeys {
    keys: HashSet<RunKey>,
    order: VecDeque<RunKey>,
    limit: usize,
}

impl CancelledKeys {
    fn new(limit: usize) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    fn insert(&mut self, key: RunKey) {
        if !self.keys.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }

    /// Whether `key` was cancelled; forgets it either way.
    fn take(&mut self, key: &RunKey) -> bool {
        if self.keys.remove(key) {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.keys.len()
    }
}

/// A fixed set of workers sharing one endpoint.
///
/// A worker whose work panics dies with it and is not replaced; its claimed
/// item is recovered by the executor's deadline.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: usize, endpoint: WorkerEndpoint, registry: Arc<WorkRegistry>) -> Self {
        let shutdown = CancellationToken::new();
        let handles = (0..workers.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    control: endpoint.subscribe_control(),
                    endpoint: endpoint.clone(),
                    registry: registry.clone(),
                    shutdown: shutdown.clone(),
                    cancelled: CancelledKeys::new(REMEMBERED_CANCELS),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(workers, "worker pool started");
        Self { shutdown, handles }
    }

    /// Workers still running (crashed ones excluded).
    pub fn alive(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Stop claiming new items and wait for every worker to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    debug!("worker had already crashed");
                }
            }
        }
        info!("worker pool stopped");
    }
}

struct Worker {
    id: usize,
    endpoint: WorkerEndpoint,
    control: broadcast::Receiver<String>,
    registry: Arc<WorkRegistry>,
    shutdown: CancellationToken,
    cancelled: CancelledKeys,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker = self.id, "worker started");

        loop {
            let raw = {
                let mut jobs = self.endpoint.jobs.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => None,
                    raw = jobs.recv() => raw,
                }
            };
            let Some(raw) = raw else { break };

            let item: WorkItem = match serde_json::from_str(&raw) {
                Ok(item) => item,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "discarding malformed work item");
                    continue;
                }
            };

            self.drain_control();
            if self.cancelled.take(&item.key) {
                debug!(worker = self.id, key = %item.key, "skipping cancelled work item");
                continue;
            }

            self.process(item).await;
        }

        debug!(worker = self.id, "worker stopped");
    }

    async fn process(&mut self, item: WorkItem) {
        let key = item.key.clone();
        self.publish(WorkerMessage::Claimed {
            key: key.clone(),
            worker: self.id,
        });

        let Some(work) = self.registry.get(&key.task) else {
            self.publish(WorkerMessage::Finished {
                key: key.clone(),
                result: Err(TaskError::Failure(format!(
                    "no work registered for task '{}'",
                    key.task
                ))),
            });
            return;
        };

        let cancel = CancellationToken::new();
        let ctx = WorkContext {
            execution_id: key.execution_id,
            task: key.task.clone(),
            attempt: key.attempt,
            inputs: item.inputs,
            parameters: item.parameters,
            cancel: cancel.clone(),
        };
        let timeout = Duration::from_millis(item.timeout_ms);
        debug!(worker = self.id, %key, "running work item");

        let run = work.run(ctx);
        tokio::pin!(run);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut listening = true;

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = &mut deadline => {
                    cancel.cancel();
                    break Err(TaskError::Timeout(timeout));
                }
                msg = self.control.recv(), if listening => match msg {
                    Ok(raw) => {
                        if let Some(target) = parse_cancel(&raw) {
                            if target == key {
                                debug!(worker = self.id, %key, "cancelling running work item");
                                cancel.cancel();
                            } else {
                                self.cancelled.insert(target);
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(worker = self.id, skipped, "control channel lagged");
                    }
                    Err(RecvError::Closed) => listening = false,
                },
            }
        };

        self.publish(WorkerMessage::Finished { key, result });
    }

    fn drain_control(&mut self) {
        loop {
            match self.control.try_recv() {
                Ok(raw) => {
                    if let Some(key) = parse_cancel(&raw) {
                        self.cancelled.insert(key);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(worker = self.id, skipped, "control channel lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    fn publish(&self, msg: WorkerMessage) {
        match serde_json::to_string(&msg) {
            Ok(raw) => {
                if self.endpoint.results.send(raw).is_err() {
                    debug!(worker = self.id, "result channel closed");
                }
            }
            Err(e) => warn!(worker = self.id, error = %e, "failed to serialize worker message"),
        }
    }
}

fn parse_cancel(raw: &str) -> Option<RunKey> {
    match serde_json::from_str::<ControlMessage>(raw) {
        Ok(ControlMessage::Cancel { key }) => Some(key),
        Err(e) => {
            warn!(error = %e, "discarding malformed control message");
            None
        }
    }
}
