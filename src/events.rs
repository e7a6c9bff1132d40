// src/events.rs

//! State-transition events for external persistence.
//!
//! Every status change applied by the state machine is emitted as a
//! [`StateEvent`] to an [`EventSink`]. Emission is fire-and-forget: sinks
//! must never block the control loop, and a failing sink never fails a
//! task or a run.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dag::TaskName;
use crate::errors::Result;
use crate::state::Status;

/// A single status transition, for an execution (`task_name == None`) or
/// one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub execution_id: Uuid,
    pub task_name: Option<TaskName>,
    pub attempt: u32,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Receiver of state-transition events.
pub trait EventSink: Send + Sync + Debug {
    fn emit(&self, event: &StateEvent);
}

/// Logs every event through `tracing`. This is the default sink.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &StateEvent) {
        match &event.task_name {
            Some(task) => debug!(
                execution_id = %event.execution_id,
                task = %task,
                attempt = event.attempt,
                status = %event.status,
                error = event.error.as_deref().unwrap_or(""),
                "task state transition"
            ),
            None => info!(
                execution_id = %event.execution_id,
                status = %event.status,
                error = event.error.as_deref().unwrap_or(""),
                "execution state transition"
            ),
        }
    }
}

/// Forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StateEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &StateEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!("event receiver dropped; discarding state event");
        }
    }
}

/// Appends events as JSON lines to a file from a background writer task.
///
/// The writer task ends once every clone of the sink has been dropped;
/// await the returned handle to make sure all lines reached the file.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    tx: mpsc::UnboundedSender<StateEvent>,
}

impl JsonLinesSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<(Self, JoinHandle<()>)> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<StateEvent>();

        let handle = tokio::spawn(async move {
            let mut file = file;
            while let Some(event) = rx.recv().await {
                let mut line = match serde_json::to_vec(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize state event");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = file.write_all(&line).await {
                    warn!(path = %path.display(), error = %e, "failed to persist state event");
                }
            }
            if let Err(e) = file.flush().await {
                warn!(path = %path.display(), error = %e, "failed to flush event log");
            }
            debug!(path = %path.display(), "event writer finished");
        });

        Ok((Self { tx }, handle))
    }
}

impl EventSink for JsonLinesSink {
    fn emit(&self, event: &StateEvent) {
        if self.tx.send(event.clone()).is_err() {
            warn!("event writer stopped; state event not persisted");
        }
    }
}

/// Sends each event to several sinks in order.
#[derive(Debug, Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &StateEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
