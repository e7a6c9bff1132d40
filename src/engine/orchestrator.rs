// src/engine/orchestrator.rs

//! Registry of background executions, addressable by execution id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::engine::pipeline::Pipeline;
use crate::engine::runner::{RunControl, RunReport};
use crate::errors::{Result, RundagError};
use crate::exec::Executor;
use crate::state::ExecutionContext;
use crate::work::Parameters;

struct ExecutionEntry {
    status: watch::Receiver<ExecutionContext>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<RunReport>>>,
}

/// Starts pipeline executions in the background and answers status and
/// cancellation requests for them.
#[derive(Default)]
pub struct Orchestrator {
    executions: Mutex<HashMap<Uuid, ExecutionEntry>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("executions", &self.lock().len())
            .finish()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the pipeline and start it on `executor`.
    ///
    /// Construction errors (cycles, unknown dependencies) are returned here
    /// and no execution is registered.
    pub fn execute(
        &self,
        pipeline: Arc<Pipeline>,
        parameters: Parameters,
        mut executor: Box<dyn Executor>,
    ) -> Result<Uuid> {
        pipeline.build_dag()?;

        let control = RunControl::new();
        let execution_id = control.execution_id;
        let (tx, rx) = watch::channel(ExecutionContext::new(
            execution_id,
            pipeline.id.clone(),
            parameters.clone(),
        ));
        let control = control.with_status(tx);
        let cancel = control.cancel.clone();

        let handle = tokio::spawn(async move {
            pipeline
                .execute_with(parameters, executor.as_mut(), control)
                .await
        });

        info!(%execution_id, "execution registered");
        self.lock().insert(
            execution_id,
            ExecutionEntry {
                status: rx,
                cancel,
                handle: Some(handle),
            },
        );
        Ok(execution_id)
    }

    /// Latest snapshot of an execution.
    pub fn status(&self, execution_id: Uuid) -> Option<ExecutionContext> {
        self.lock()
            .get(&execution_id)
            .map(|entry| entry.status.borrow().clone())
    }

    /// Request cancellation. Returns `false` for unknown ids.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.lock().get(&execution_id) {
            Some(entry) => {
                info!(%execution_id, "cancelling execution");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for an execution to finish and return its report.
    ///
    /// The report can be taken once; later calls fail, while
    /// [`status`](Orchestrator::status) keeps returning the final context.
    pub async fn wait(&self, execution_id: Uuid) -> Result<RunReport> {
        let handle = self
            .lock()
            .get_mut(&execution_id)
            .and_then(|entry| entry.handle.take())
            .ok_or_else(|| {
                RundagError::Executor(format!("no awaitable execution {execution_id}"))
            })?;

        handle
            .await
            .map_err(|e| RundagError::Executor(format!("execution {execution_id} aborted: {e}")))?
    }

    pub fn executions(&self) -> Vec<Uuid> {
        self.lock().keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ExecutionEntry>> {
        self.executions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
