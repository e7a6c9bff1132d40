// src/exec/distributed.rs

//! Executor that ships jobs to a worker pool over a serialized work queue.
//!
//! Each job becomes a [`WorkItem`] on the queue. Workers acknowledge with
//! `Claimed` and report with `Finished`. The executor tracks one deadline
//! per outstanding item: `submitted + timeout` until claimed, then
//! `claimed + timeout`. An item whose deadline passes is reported as a
//! timeout and forgotten; whatever its worker sends later is dropped, so
//! the run loop sees at most one completion per handle.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::errors::{Result, RundagError, TaskError};
use crate::exec::queue::{ControlMessage, WorkItem, WorkQueue, WorkerMessage, work_queue};
use crate::exec::worker::{WorkRegistry, WorkerPool};
use crate::exec::{BoxFuture, Completion, Executor, Job, RunKey, TaskHandle};

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

#[derive(Debug)]
struct Outstanding {
    deadline: Instant,
    timeout: Duration,
    claimed_by: Option<usize>,
}

#[derive(Debug)]
pub struct DistributedExecutor {
    queue: WorkQueue,
    capacity: usize,
    pending: HashMap<RunKey, Outstanding>,
    ready: VecDeque<Completion>,
    results_closed: bool,
}

impl DistributedExecutor {
    pub fn new(queue: WorkQueue, capacity: usize) -> Self {
        Self {
            queue,
            capacity: capacity.max(1),
            pending: HashMap::new(),
            ready: VecDeque::new(),
            results_closed: false,
        }
    }

    /// Create a queue, spawn `workers` workers on it and return both ends.
    pub fn with_workers(workers: usize, registry: WorkRegistry) -> (Self, WorkerPool) {
        let (queue, endpoint) = work_queue();
        let pool = WorkerPool::spawn(workers, endpoint, Arc::new(registry));
        (Self::new(queue, workers), pool)
    }

    /// Wait for one queue event or deadline and fold it into `ready`.
    async fn pump(&mut self) {
        let next_deadline = self.pending.values().map(|o| o.deadline).min();

        tokio::select! {
            raw = self.queue.results.recv(), if !self.results_closed => match raw {
                Some(raw) => self.handle_message(&raw),
                None => {
                    warn!("all workers are gone; outstanding items will time out");
                    self.results_closed = true;
                }
            },
            _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                self.reap_expired();
            }
        }
    }

    fn handle_message(&mut self, raw: &str) {
        let msg: WorkerMessage = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "discarding malformed worker message");
                return;
            }
        };

        match msg {
            WorkerMessage::Claimed { key, worker } => match self.pending.get_mut(&key) {
                Some(entry) if entry.claimed_by.is_none() => {
                    entry.claimed_by = Some(worker);
                    entry.deadline = deadline_after(entry.timeout);
                    debug!(%key, worker, "work item claimed");
                }
                Some(_) => debug!(%key, worker, "duplicate claim ignored"),
                None => debug!(%key, worker, "claim for unknown item ignored"),
            },
            WorkerMessage::Finished { key, result } => {
                if self.pending.remove(&key).is_some() {
                    self.ready.push_back(Completion::new(key, result));
                } else {
                    debug!(%key, "dropping late result");
                }
            }
        }
    }

    fn reap_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<RunKey> = self
            .pending
            .iter()
            .filter(|(_, o)| o.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();

        for key in expired {
            if let Some(entry) = self.pending.remove(&key) {
                info!(
                    %key,
                    claimed_by = ?entry.claimed_by,
                    timeout = ?entry.timeout,
                    "work item not acknowledged in time; reclaiming slot"
                );
                self.broadcast_cancel(&key);
                self.ready
                    .push_back(Completion::new(key, Err(TaskError::Timeout(entry.timeout))));
            }
        }
    }

    fn broadcast_cancel(&self, key: &RunKey) {
        let msg = ControlMessage::Cancel { key: key.clone() };
        match serde_json::to_string(&msg) {
            // No receivers just means no worker is alive to care.
            Ok(raw) => {
                let _ = self.queue.control.send(raw);
            }
            Err(e) => warn!(error = %e, "failed to serialize control message"),
        }
    }
}

impl Executor for DistributedExecutor {
    fn submit(&mut self, job: Job) -> BoxFuture<'_, Result<TaskHandle>> {
        Box::pin(async move {
            while self.pending.len() >= self.capacity {
                self.pump().await;
            }

            let item = WorkItem {
                key: job.key.clone(),
                inputs: job.inputs,
                parameters: job.parameters,
                timeout_ms: u64::try_from(job.timeout.as_millis()).unwrap_or(u64::MAX),
            };
            let raw = serde_json::to_string(&item)
                .map_err(|e| RundagError::Executor(format!("serializing work item: {e}")))?;

            self.queue
                .jobs
                .send(raw)
                .map_err(|_| RundagError::Executor("work queue closed".to_string()))?;

            debug!(key = %job.key, "work item enqueued");
            self.pending.insert(
                job.key.clone(),
                Outstanding {
                    deadline: deadline_after(job.timeout),
                    timeout: job.timeout,
                    claimed_by: None,
                },
            );
            Ok(job.key)
        })
    }

    fn await_any(&mut self) -> BoxFuture<'_, Option<Completion>> {
        Box::pin(async move {
            loop {
                if let Some(done) = self.ready.pop_front() {
                    return Some(done);
                }
                if self.pending.is_empty() {
                    return None;
                }
                self.pump().await;
            }
        })
    }

    fn cancel(&mut self, handle: &TaskHandle) {
        let Some(entry) = self.pending.get(handle) else {
            return;
        };

        self.broadcast_cancel(handle);
        if entry.claimed_by.is_none() {
            debug!(%handle, "cancelling unclaimed work item");
            self.pending.remove(handle);
            self.ready
                .push_back(Completion::new(handle.clone(), Err(TaskError::Cancelled)));
        } else {
            debug!(%handle, "cancellation sent to worker");
        }
    }

    fn in_flight(&self) -> usize {
        self.pending.len() + self.ready.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}
