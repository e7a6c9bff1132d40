// tests/distributed.rs

mod common;
use crate::common::{TestResult, fast_retry, init_tracing, with_timeout};

use std::time::Duration;

use serde_json::{Value, json};

use rundag::dag::Task;
use rundag::engine::{Pipeline, RunControl};
use rundag::errors::TaskError;
use rundag::exec::{DistributedExecutor, WorkRegistry};
use rundag::state::Status;
use rundag::work::{Parameters, work_fn};
use rundag_test_utils::fake_work::{BlockingWork, CallLog, PanickingWork, RecordingWork};

fn sum_inputs(inputs: &rundag::work::TaskInput) -> i64 {
    inputs.values().filter_map(Value::as_i64).sum()
}

#[tokio::test]
async fn diamond_runs_through_the_work_queue() -> TestResult {
    init_tracing();

    let mut p = Pipeline::new("queued").with_retry_policy(fast_retry());
    p.add_task(Task::new("A", work_fn(|_| async { Ok(json!(2)) })))
        .add_task(
            Task::new(
                "B",
                work_fn(|ctx| async move { Ok::<_, TaskError>(json!(sum_inputs(&ctx.inputs) * 3)) }),
            )
            .after(["A"]),
        )
        .add_task(
            Task::new(
                "C",
                work_fn(|ctx| async move { Ok::<_, TaskError>(json!(sum_inputs(&ctx.inputs) + 1)) }),
            )
            .after(["A"]),
        )
        .add_task(
            Task::new(
                "D",
                work_fn(|ctx| async move { Ok::<_, TaskError>(json!(sum_inputs(&ctx.inputs))) }),
            )
            .after(["B", "C"]),
        );

    let registry = WorkRegistry::from_dag(&p.build_dag()?);
    let (mut executor, pool) = DistributedExecutor::with_workers(2, registry);

    let report = with_timeout(p.execute(Parameters::new(), &mut executor)).await;
    pool.shutdown().await;
    let report = report?;

    assert_eq!(report.status(), Status::Success);
    assert_eq!(report.outputs.get("D"), Some(&json!(9)));
    Ok(())
}

#[tokio::test]
async fn crashed_worker_is_recovered_by_the_deadline_and_retried() -> TestResult {
    init_tracing();

    let mut p = Pipeline::new("crash").with_retry_policy(fast_retry());
    p.add_task(
        Task::new("fragile", PanickingWork::first_attempts(1))
            .with_timeout(Duration::from_millis(200))
            .with_max_retries(1),
    );

    let registry = WorkRegistry::from_dag(&p.build_dag()?);
    let (mut executor, pool) = DistributedExecutor::with_workers(2, registry);

    let report = with_timeout(p.execute(Parameters::new(), &mut executor)).await;
    let alive = pool.alive();
    pool.shutdown().await;
    let report = report?;

    assert_eq!(report.status(), Status::Success);
    let statuses: Vec<(u32, Status)> = report
        .runs_for("fragile")
        .map(|r| (r.attempt, r.status))
        .collect();
    assert_eq!(statuses, [(1, Status::Retry), (2, Status::Success)]);

    let first = report.runs_for("fragile").next().ok_or("no first attempt")?;
    assert!(
        first.error.as_deref().unwrap_or_default().contains("timed out"),
        "{:?}",
        first.error
    );
    assert_eq!(alive, 1);
    Ok(())
}

#[tokio::test]
async fn task_missing_from_the_registry_fails() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("unregistered");
    p.add_task(Task::new("known", RecordingWork::new(&log)))
        .add_task(Task::new("unknown", RecordingWork::new(&log)));

    let mut registry = WorkRegistry::new();
    registry.register("known", std::sync::Arc::new(RecordingWork::new(&log)));
    let (mut executor, pool) = DistributedExecutor::with_workers(1, registry);

    let report = with_timeout(p.execute(Parameters::new(), &mut executor)).await;
    pool.shutdown().await;
    let report = report?;

    assert_eq!(report.status(), Status::Failed);
    assert_eq!(report.final_status_of("known"), Some(Status::Success));
    let run = report.runs_for("unknown").last().ok_or("no run")?;
    assert_eq!(
        run.error.as_deref(),
        Some("no work registered for task 'unknown'")
    );
    Ok(())
}

#[tokio::test]
async fn cancellation_reaches_remote_workers() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("remote-cancel");
    p.add_task(Task::new("long", BlockingWork::new(&log)))
        .add_task(Task::new("next", RecordingWork::new(&log)).after(["long"]));

    let registry = WorkRegistry::from_dag(&p.build_dag()?);
    let (mut executor, pool) = DistributedExecutor::with_workers(1, registry);

    let control = RunControl::new();
    let cancel = control.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let report = with_timeout(p.execute_with(Parameters::new(), &mut executor, control)).await;
    pool.shutdown().await;
    let report = report?;

    assert_eq!(report.status(), Status::Cancelled);
    assert_eq!(report.final_status_of("long"), Some(Status::Cancelled));
    assert_eq!(report.final_status_of("next"), Some(Status::Cancelled));
    assert_eq!(log.attempts_of("next"), 0);
    Ok(())
}

#[tokio::test]
async fn task_without_a_timeout_bound_runs_remotely() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("unbounded");
    p.add_task(Task::new("patient", RecordingWork::new(&log)).with_timeout(Duration::MAX));

    let registry = WorkRegistry::from_dag(&p.build_dag()?);
    let (mut executor, pool) = DistributedExecutor::with_workers(1, registry);

    let report = with_timeout(p.execute(Parameters::new(), &mut executor)).await;
    pool.shutdown().await;
    let report = report?;

    assert_eq!(report.status(), Status::Success);
    assert_eq!(log.attempts_of("patient"), 1);
    Ok(())
}
