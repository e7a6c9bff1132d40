// src/work/command.rs

//! Shell-command task work.

use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::TaskError;
use crate::work::{TaskWork, WorkContext};

/// Runs `cmd` through the platform shell.
///
/// Upstream outputs are passed as a JSON object in `RUNDAG_INPUT` and the
/// run parameters in `RUNDAG_PARAMS`. Stdout is parsed as JSON; anything
/// that does not parse becomes a JSON string (empty stdout becomes `null`).
/// A non-zero exit status fails the attempt.
#[derive(Debug, Clone)]
pub struct CommandWork {
    cmd: String,
}

impl CommandWork {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    fn shell_command(&self) -> Command {
        if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.cmd);
            c
        }
    }
}

#[async_trait]
impl TaskWork for CommandWork {
    async fn run(&self, ctx: WorkContext) -> Result<Value, TaskError> {
        info!(
            task = %ctx.task,
            attempt = ctx.attempt,
            cmd = %self.cmd,
            "starting task process"
        );

        let input = serde_json::to_string(&ctx.inputs)
            .context("serializing task inputs")?;
        let params = serde_json::to_string(&ctx.parameters)
            .context("serializing run parameters")?;

        let mut cmd = self.shell_command();
        cmd.env("RUNDAG_INPUT", input)
            .env("RUNDAG_PARAMS", params)
            .env("RUNDAG_TASK", &ctx.task)
            .env("RUNDAG_ATTEMPT", ctx.attempt.to_string())
            .env("RUNDAG_EXECUTION_ID", ctx.execution_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning process for task '{}'", ctx.task))?;

        let stdout = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                out.read_to_end(&mut buf).await.map(|_| buf)
            })
        });

        // Always consume stderr so buffers don't fill; keep the last line
        // for the failure message.
        let stderr = child.stderr.take().map(|err| {
            let task_name = ctx.task.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                let mut last = None;
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task = %task_name, "stderr: {}", line);
                    if !line.trim().is_empty() {
                        last = Some(line);
                    }
                }
                last
            })
        });

        let status = tokio::select! {
            status = child.wait() => status
                .with_context(|| format!("waiting for process of task '{}'", ctx.task))?,
            _ = ctx.cancel.cancelled() => {
                info!(task = %ctx.task, attempt = ctx.attempt, "cancellation requested; killing process");
                if let Err(e) = child.kill().await {
                    warn!(task = %ctx.task, error = %e, "failed to kill child process on cancellation");
                }
                return Err(TaskError::Cancelled);
            }
        };

        let code = status.code().unwrap_or(-1);
        info!(
            task = %ctx.task,
            attempt = ctx.attempt,
            exit_code = code,
            success = status.success(),
            "task process exited"
        );

        let last_stderr = match stderr {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        };

        if !status.success() {
            let msg = match last_stderr {
                Some(line) => format!("command exited with code {code}: {line}"),
                None => format!("command exited with code {code}"),
            };
            return Err(TaskError::Failure(msg));
        }

        let bytes = match stdout {
            Some(handle) => handle
                .await
                .context("stdout reader panicked")?
                .context("reading task stdout")?,
            None => Vec::new(),
        };

        Ok(parse_output(&bytes))
    }

    fn describe(&self) -> String {
        format!("sh -c {:?}", self.cmd)
    }
}

fn parse_output(bytes: &[u8]) -> Value {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}
