// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod events;
pub mod exec;
pub mod logging;
pub mod state;
pub mod types;
pub mod work;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::ConfigFile;
use crate::config::loader::load_and_validate;
use crate::engine::{RunControl, RunReport};
use crate::events::{EventSink, FanoutSink, JsonLinesSink, TracingSink};
use crate::exec::{DistributedExecutor, LocalExecutor};
use crate::state::Status;
use crate::types::BackendKind;
use crate::work::Parameters;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and CLI overrides
/// - event sinks
/// - the chosen executor backend
/// - Ctrl-C handling
///
/// Returns the final execution status; `--dry-run` and `--dot` report
/// `success` without running anything.
pub async fn run(args: CliArgs) -> Result<Status> {
    let mut cfg = load_and_validate(&args.config)?;
    apply_overrides(&mut cfg, &args)?;

    if args.dot {
        let dag = cfg.build_pipeline(Arc::new(TracingSink)).build_dag()?;
        print!("{}", dag.to_dot());
        return Ok(Status::Success);
    }

    if args.dry_run {
        print_dry_run(&cfg)?;
        return Ok(Status::Success);
    }

    let parameters: Parameters = args.params.iter().cloned().collect();

    let mut fanout = FanoutSink::new(vec![Arc::new(TracingSink)]);
    let writer = match &args.events {
        Some(path) => {
            let (sink, handle) = JsonLinesSink::create(path).await?;
            fanout.push(Arc::new(sink));
            info!(path = %path.display(), "persisting state events");
            Some(handle)
        }
        None => None,
    };
    let sink: Arc<dyn EventSink> = Arc::new(fanout);
    let pipeline = cfg.build_pipeline(sink);

    // Ctrl-C → cancel the run.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received; cancelling execution");
            cancel.cancel();
        });
    }
    let control = RunControl::new().with_cancel(cancel);

    let outcome = match cfg.executor.backend {
        BackendKind::Local => {
            let mut executor = LocalExecutor::new(cfg.pipeline.max_parallel_tasks);
            pipeline.execute_with(parameters, &mut executor, control).await
        }
        BackendKind::Distributed => {
            let (mut executor, pool) =
                DistributedExecutor::with_workers(cfg.executor.workers, cfg.work_registry());
            let outcome = pipeline
                .execute_with(parameters, &mut executor, control)
                .await;
            pool.shutdown().await;
            outcome
        }
    };

    // Dropping the pipeline releases the last sink handle so the event
    // writer can drain and exit. Flush before reporting either outcome.
    drop(pipeline);
    if let Some(handle) = writer {
        if let Err(e) = handle.await {
            warn!(error = %e, "event writer task failed");
        }
    }

    let report = outcome?;
    print_summary(&report);
    Ok(report.status())
}

fn apply_overrides(cfg: &mut ConfigFile, args: &CliArgs) -> Result<()> {
    if let Some(n) = args.max_parallel {
        if n == 0 {
            bail!("--max-parallel must be >= 1");
        }
        cfg.pipeline.max_parallel_tasks = n;
    }
    if let Some(n) = args.workers {
        if n == 0 {
            bail!("--workers must be >= 1");
        }
        cfg.executor.workers = n;
    }
    if let Some(backend) = args.backend {
        cfg.executor.backend = backend;
    }
    Ok(())
}

/// Print the pipeline settings and tasks in execution-hint order.
fn print_dry_run(cfg: &ConfigFile) -> Result<()> {
    let dag = cfg.build_pipeline(Arc::new(TracingSink)).build_dag()?;

    println!("rundag dry-run");
    println!("  pipeline.name = {}", cfg.pipeline.name);
    println!("  pipeline.processing_mode = {}", cfg.pipeline.processing_mode);
    println!(
        "  pipeline.max_parallel_tasks = {}",
        cfg.pipeline.max_parallel_tasks
    );
    println!(
        "  executor = {} (workers = {})",
        cfg.executor.backend, cfg.executor.workers
    );
    println!(
        "  retry = base {:?}, max {:?}, jitter {}",
        cfg.retry.base_delay, cfg.retry.max_delay, cfg.retry.jitter
    );
    println!();

    println!("tasks ({}):", dag.len());
    for name in dag.order_hint() {
        let Some(task) = cfg.task.get(name) else {
            continue;
        };
        println!("  - {name}");
        println!("      cmd: {}", task.cmd);
        if !task.after.is_empty() {
            println!("      after: {:?}", task.after);
        }
        println!("      timeout: {:?}", task.timeout);
        if task.max_retries > 0 {
            println!("      max_retries: {}", task.max_retries);
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}

fn print_summary(report: &RunReport) {
    let ctx = &report.context;
    let metric = |key: &str| ctx.metric(key).unwrap_or(0.0) as u64;

    println!(
        "execution {} {} ({} tasks, {} attempts, {} retries, {}ms)",
        ctx.execution_id,
        ctx.status,
        metric("tasks_total"),
        metric("task_attempts"),
        metric("retries"),
        metric("duration_ms"),
    );

    let names: BTreeSet<&str> = report
        .task_runs
        .iter()
        .map(|r| r.task_name.as_str())
        .collect();
    for name in names {
        let status = report
            .final_status_of(name)
            .map(|s| s.to_string())
            .unwrap_or_default();
        println!(
            "  {name:<24} {status:<10} attempts={}",
            report.attempts_of(name)
        );
    }

    if let Some(err) = &ctx.error {
        println!("error: {err}");
    }
}
