// src/exec/queue.rs

//! Wire types and channels between a [`DistributedExecutor`] and its
//! workers.
//!
//! Everything that crosses the boundary is serialized to JSON, so the
//! in-process channels here can be swapped for a real broker without
//! changing either side.
//!
//! [`DistributedExecutor`]: crate::exec::DistributedExecutor

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc};

use crate::errors::TaskError;
use crate::exec::RunKey;
use crate::work::{Parameters, TaskInput};

const CONTROL_CAPACITY: usize = 256;

/// A job as seen by a worker. The work itself is resolved by task name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: RunKey,
    pub inputs: TaskInput,
    pub parameters: Parameters,
    pub timeout_ms: u64,
}

/// Worker to executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Claimed {
        key: RunKey,
        worker: usize,
    },
    Finished {
        key: RunKey,
        result: Result<Value, TaskError>,
    },
}

/// Executor to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Cancel { key: RunKey },
}

/// Executor side of the queue.
#[derive(Debug)]
pub struct WorkQueue {
    pub(crate) jobs: mpsc::UnboundedSender<String>,
    pub(crate) results: mpsc::UnboundedReceiver<String>,
    pub(crate) control: broadcast::Sender<String>,
}

/// Worker side of the queue. Cloned once per worker; all clones compete
/// for the same job stream.
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    pub(crate) jobs: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    pub(crate) results: mpsc::UnboundedSender<String>,
    pub(crate) control: broadcast::Sender<String>,
}

impl WorkerEndpoint {
    pub(crate) fn subscribe_control(&self) -> broadcast::Receiver<String> {
        self.control.subscribe()
    }
}

pub fn work_queue() -> (WorkQueue, WorkerEndpoint) {
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let (control_tx, _) = broadcast::channel(CONTROL_CAPACITY);

    let queue = WorkQueue {
        jobs: jobs_tx,
        results: results_rx,
        control: control_tx.clone(),
    };
    let endpoint = WorkerEndpoint {
        jobs: Arc::new(Mutex::new(jobs_rx)),
        results: results_tx,
        control: control_tx,
    };
    (queue, endpoint)
}
