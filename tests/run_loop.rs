// tests/run_loop.rs

mod common;
use crate::common::{TestResult, channel_sink, drain, fast_retry, init_tracing, with_timeout};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::Instant;

use rundag::dag::Task;
use rundag::engine::{Pipeline, RunControl};
use rundag::errors::TaskError;
use rundag::exec::LocalExecutor;
use rundag::state::{ExecutionContext, MAX_RETRY_DELAY, RetryPolicy, Status};
use rundag::work::{Parameters, WorkContext, work_fn};
use rundag_test_utils::fake_executor::FakeExecutor;
use rundag_test_utils::fake_work::{BlockingWork, CallLog, RecordingWork, ScriptedWork};

fn input_i64(ctx: &WorkContext, task: &str) -> Result<i64, TaskError> {
    ctx.inputs
        .get(task)
        .and_then(Value::as_i64)
        .ok_or_else(|| TaskError::failure(format!("missing input from {task}")))
}

/// A -> {B, C} -> D where every task does arithmetic on its inputs.
fn arithmetic_diamond() -> Pipeline {
    let mut p = Pipeline::new("diamond").with_retry_policy(fast_retry());
    p.add_task(Task::new("A", work_fn(|_| async { Ok(json!(1)) })))
        .add_task(
            Task::new(
                "B",
                work_fn(|ctx| async move { Ok::<_, TaskError>(json!(input_i64(&ctx, "A")? + 10)) }),
            )
            .after(["A"]),
        )
        .add_task(
            Task::new(
                "C",
                work_fn(|ctx| async move { Ok::<_, TaskError>(json!(input_i64(&ctx, "A")? * 100)) }),
            )
            .after(["A"]),
        )
        .add_task(
            Task::new(
                "D",
                work_fn(|ctx| async move {
                    Ok::<_, TaskError>(json!(input_i64(&ctx, "B")? + input_i64(&ctx, "C")?))
                }),
            )
            .after(["B", "C"]),
        );
    p
}

#[tokio::test]
async fn diamond_passes_outputs_downstream() -> TestResult {
    init_tracing();

    let report = with_timeout(arithmetic_diamond().execute_local(Parameters::new())).await?;

    assert_eq!(report.status(), Status::Success);
    assert_eq!(report.outputs.get("D"), Some(&json!(111)));
    for task in ["A", "B", "C", "D"] {
        assert_eq!(report.final_status_of(task), Some(Status::Success));
        assert_eq!(report.attempts_of(task), 1);
    }
    assert_eq!(report.context.metric("tasks_total"), Some(4.0));
    assert_eq!(report.context.metric("tasks_succeeded"), Some(4.0));
    assert_eq!(report.context.metric("retries"), Some(0.0));
    assert!(report.context.ended_at.is_some());
    assert!(report.context.error.is_none());
    Ok(())
}

#[tokio::test]
async fn permanent_failure_cancels_downstream_without_running_it() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("failing").with_retry_policy(fast_retry());
    p.add_task(Task::new("A", ScriptedWork::always_failing(&log)))
        .add_task(Task::new("B", RecordingWork::new(&log)).after(["A"]))
        .add_task(Task::new("C", RecordingWork::new(&log)).after(["A"]))
        .add_task(Task::new("D", RecordingWork::new(&log)).after(["B", "C"]));

    let report = with_timeout(p.execute_local(Parameters::new())).await?;

    assert_eq!(report.status(), Status::Failed);
    assert_eq!(log.order(), ["A"]);
    assert_eq!(report.final_status_of("A"), Some(Status::Failed));
    for task in ["B", "C", "D"] {
        let runs: Vec<_> = report.runs_for(task).collect();
        assert_eq!(runs.len(), 1, "{task}");
        assert_eq!(runs[0].status, Status::Cancelled);
        assert_eq!(runs[0].attempt, 0);
        assert!(runs[0].started_at.is_none());
    }

    let error = report.context.error.clone().unwrap_or_default();
    assert!(
        error.contains("task 'A' failed after 1 attempt(s)"),
        "{error}"
    );
    assert_eq!(report.context.metric("tasks_failed"), Some(1.0));
    assert_eq!(report.context.metric("tasks_cancelled"), Some(3.0));
    assert_eq!(report.context.metric("tasks_blocked"), Some(3.0));
    Ok(())
}

#[tokio::test]
async fn independent_branch_keeps_running_after_a_failure() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("branches").with_retry_policy(fast_retry());
    p.add_task(Task::new("bad", ScriptedWork::always_failing(&log)))
        .add_task(Task::new("bad_child", RecordingWork::new(&log)).after(["bad"]))
        .add_task(Task::new("good", RecordingWork::new(&log)))
        .add_task(Task::new("good_child", RecordingWork::new(&log)).after(["good"]));

    let report = with_timeout(p.execute_local(Parameters::new())).await?;

    assert_eq!(report.status(), Status::Failed);
    assert_eq!(report.final_status_of("good_child"), Some(Status::Success));
    assert_eq!(report.final_status_of("bad_child"), Some(Status::Cancelled));
    assert_eq!(log.attempts_of("bad_child"), 0);
    Ok(())
}

#[tokio::test]
async fn task_runs_at_most_max_retries_plus_one_times() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("retries").with_retry_policy(fast_retry());
    p.add_task(Task::new("flaky", ScriptedWork::always_failing(&log)).with_max_retries(2));

    let report = with_timeout(p.execute_local(Parameters::new())).await?;

    assert_eq!(report.status(), Status::Failed);
    assert_eq!(log.attempts_of("flaky"), 3);

    let statuses: Vec<(u32, Status)> = report
        .runs_for("flaky")
        .map(|r| (r.attempt, r.status))
        .collect();
    assert_eq!(
        statuses,
        [(1, Status::Retry), (2, Status::Retry), (3, Status::Failed)]
    );
    assert_eq!(report.context.metric("retries"), Some(2.0));

    let error = report.context.error.clone().unwrap_or_default();
    assert!(error.contains("after 3 attempt(s)"), "{error}");
    assert!(error.contains("failed on attempt 3"), "{error}");
    Ok(())
}

#[tokio::test]
async fn retry_recovers_a_flaky_task() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("recover").with_retry_policy(fast_retry());
    p.add_task(Task::new("flaky", ScriptedWork::failing(&log, 2)).with_max_retries(3))
        .add_task(Task::new("after", RecordingWork::new(&log)).after(["flaky"]));

    let report = with_timeout(p.execute_local(Parameters::new())).await?;

    assert_eq!(report.status(), Status::Success);
    assert_eq!(report.attempts_of("flaky"), 3);
    assert_eq!(report.outputs.get("flaky"), Some(&json!({ "attempt": 3 })));

    // The retry output, not an earlier failure, reaches the dependent.
    let calls = log.calls();
    let after = calls.iter().find(|c| c.task == "after").ok_or("after never ran")?;
    assert_eq!(after.inputs.get("flaky"), Some(&json!({ "attempt": 3 })));
    Ok(())
}

#[tokio::test]
async fn parallelism_of_one_runs_independent_tasks_sequentially() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("serial").with_max_parallel_tasks(1);
    p.add_task(Task::new("X", RecordingWork::new(&log).with_delay(Duration::from_millis(30))))
        .add_task(Task::new("Y", RecordingWork::new(&log).with_delay(Duration::from_millis(30))));

    let report = with_timeout(p.execute_local(Parameters::new())).await?;

    assert_eq!(report.status(), Status::Success);
    assert_eq!(log.order(), ["X", "Y"]);
    assert_eq!(log.max_concurrency(), 1);
    Ok(())
}

#[tokio::test]
async fn independent_tasks_overlap_up_to_the_limit() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("wide").with_max_parallel_tasks(2);
    for name in ["t1", "t2", "t3", "t4"] {
        p.add_task(Task::new(
            name,
            RecordingWork::new(&log).with_delay(Duration::from_millis(50)),
        ));
    }

    let report = with_timeout(p.execute_local(Parameters::new())).await?;

    assert_eq!(report.status(), Status::Success);
    assert_eq!(log.max_concurrency(), 2);
    Ok(())
}

#[tokio::test]
async fn fake_executor_sees_submissions_in_order_hint_order() -> TestResult {
    init_tracing();
    let submitted = Arc::new(Mutex::new(Vec::new()));
    let mut executor = FakeExecutor::new(1, Arc::clone(&submitted));

    let report = with_timeout(arithmetic_diamond().execute(Parameters::new(), &mut executor))
        .await?;

    assert_eq!(report.status(), Status::Success);
    let order: Vec<String> = submitted
        .lock()
        .unwrap()
        .iter()
        .map(|k| k.task.clone())
        .collect();
    assert_eq!(order, ["A", "B", "C", "D"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retry_waits_at_least_the_exponential_backoff() -> TestResult {
    init_tracing();
    let starts: Arc<Mutex<Vec<Instant>>> = Arc::default();

    let recorded = Arc::clone(&starts);
    let work = work_fn(move |ctx| {
        recorded.lock().unwrap().push(Instant::now());
        async move {
            if ctx.attempt < 3 {
                Err(TaskError::failure("not yet"))
            } else {
                Ok(Value::Null)
            }
        }
    });

    let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60)).without_jitter();
    let mut p = Pipeline::new("backoff").with_retry_policy(policy);
    p.add_task(Task::new("slow_start", work).with_max_retries(2));

    let submitted = Arc::new(Mutex::new(Vec::new()));
    let mut executor = FakeExecutor::new(4, submitted);
    let report = p.execute(Parameters::new(), &mut executor).await?;

    assert_eq!(report.status(), Status::Success);
    let starts = starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 3);
    assert!(starts[1] - starts[0] >= Duration::from_secs(1));
    assert!(starts[2] - starts[1] >= Duration::from_secs(2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retry_delay_beyond_the_timer_range_is_clamped() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let three_years = Duration::from_secs(3 * 365 * 24 * 60 * 60);
    let mut p = Pipeline::new("patient")
        .with_retry_policy(RetryPolicy::new(three_years, three_years).without_jitter());
    p.add_task(Task::new("flaky", ScriptedWork::failing(&log, 1)).with_max_retries(1));

    let submitted = Arc::new(Mutex::new(Vec::new()));
    let mut executor = FakeExecutor::new(1, submitted);
    let started = Instant::now();
    let report = p.execute(Parameters::new(), &mut executor).await?;

    assert_eq!(report.status(), Status::Success);
    assert_eq!(log.attempts_of("flaky"), 2);
    assert!(started.elapsed() >= MAX_RETRY_DELAY);
    Ok(())
}

#[tokio::test]
async fn work_that_cancels_itself_fails_the_run() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("self_cancel").with_retry_policy(fast_retry());
    p.add_task(
        Task::new("A", work_fn(|_| async { Err(TaskError::Cancelled) })).with_max_retries(2),
    )
    .add_task(Task::new("B", RecordingWork::new(&log)).after(["A"]));

    let report = with_timeout(p.execute_local(Parameters::new())).await?;

    assert_eq!(report.status(), Status::Failed);
    let runs: Vec<(u32, Status)> = report.runs_for("A").map(|r| (r.attempt, r.status)).collect();
    assert_eq!(runs, [(1, Status::Failed)]);
    assert_eq!(report.final_status_of("B"), Some(Status::Cancelled));
    assert_eq!(log.attempts_of("B"), 0);

    let error = report.context.error.clone().unwrap_or_default();
    assert!(error.contains("task 'A' failed after 1 attempt(s)"), "{error}");
    Ok(())
}

#[tokio::test]
async fn cancelling_during_a_retry_wait_cancels_the_next_attempt() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let policy = RetryPolicy::new(Duration::from_secs(3600), Duration::from_secs(3600));
    let mut p = Pipeline::new("cancel_retry").with_retry_policy(policy.without_jitter());
    p.add_task(Task::new("flaky", ScriptedWork::always_failing(&log)).with_max_retries(3));

    let control = RunControl::new();
    let cancel = control.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let mut executor = LocalExecutor::new(2);
    let report = with_timeout(p.execute_with(Parameters::new(), &mut executor, control)).await?;

    assert_eq!(report.status(), Status::Cancelled);
    assert_eq!(log.attempts_of("flaky"), 1);
    let runs: Vec<(u32, Status)> = report
        .runs_for("flaky")
        .map(|r| (r.attempt, r.status))
        .collect();
    assert_eq!(runs, [(1, Status::Retry), (2, Status::Cancelled)]);
    Ok(())
}

#[tokio::test]
async fn slow_attempt_is_failed_with_a_timeout() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("timeout").with_retry_policy(fast_retry());
    p.add_task(Task::new("stuck", BlockingWork::new(&log)).with_timeout(Duration::from_millis(50)))
        .add_task(Task::new("next", RecordingWork::new(&log)).after(["stuck"]));

    let report = with_timeout(p.execute_local(Parameters::new())).await?;

    assert_eq!(report.status(), Status::Failed);
    let run = report.runs_for("stuck").last().ok_or("no run for stuck")?;
    assert_eq!(run.status, Status::Failed);
    assert!(
        run.error.as_deref().unwrap_or_default().contains("timed out"),
        "{:?}",
        run.error
    );
    assert_eq!(report.final_status_of("next"), Some(Status::Cancelled));
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_running_and_pending_tasks() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("cancel");
    p.add_task(Task::new("long", BlockingWork::new(&log)))
        .add_task(Task::new("after_long", RecordingWork::new(&log)).after(["long"]));

    let control = RunControl::new();
    let cancel = control.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let mut executor = LocalExecutor::new(2);
    let report = with_timeout(p.execute_with(Parameters::new(), &mut executor, control)).await?;

    assert_eq!(report.status(), Status::Cancelled);
    assert_eq!(report.context.error.as_deref(), Some("execution cancelled"));

    let long: Vec<_> = report.runs_for("long").collect();
    assert_eq!(long.len(), 1);
    assert_eq!(long[0].status, Status::Cancelled);
    assert_eq!(long[0].attempt, 1);

    assert_eq!(report.final_status_of("after_long"), Some(Status::Cancelled));
    assert_eq!(log.attempts_of("after_long"), 0);
    Ok(())
}

#[tokio::test]
async fn parameters_and_processing_mode_reach_every_task() -> TestResult {
    init_tracing();
    let seen: Arc<Mutex<Vec<Parameters>>> = Arc::default();

    let recorded = Arc::clone(&seen);
    let mut p = Pipeline::new("params");
    p.add_task(Task::new(
        "reader",
        work_fn(move |ctx| {
            recorded.lock().unwrap().push(ctx.parameters.clone());
            async { Ok(Value::Null) }
        }),
    ));

    let params: Parameters = [("date".to_string(), json!("2024-01-01"))].into();
    let report = with_timeout(p.execute_local(params)).await?;

    assert_eq!(report.status(), Status::Success);
    assert_eq!(report.context.parameters.get("date"), Some(&json!("2024-01-01")));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get("processing_mode"), Some(&json!("batch")));
    assert_eq!(seen[0].get("date"), Some(&json!("2024-01-01")));
    Ok(())
}

#[tokio::test]
async fn every_transition_is_emitted_in_order() -> TestResult {
    init_tracing();
    let (sink, mut rx) = channel_sink();

    let mut p = Pipeline::new("events").with_event_sink(sink);
    p.add_task(Task::new("only", work_fn(|_| async { Ok(json!("done")) })));

    let report = with_timeout(p.execute_local(Parameters::new())).await?;
    let events = drain(&mut rx);

    let trail: Vec<(Option<&str>, Status)> = events
        .iter()
        .map(|e| (e.task_name.as_deref(), e.status))
        .collect();
    assert_eq!(
        trail,
        [
            (None, Status::Running),
            (Some("only"), Status::Pending),
            (Some("only"), Status::Running),
            (Some("only"), Status::Success),
            (None, Status::Success),
        ]
    );
    assert!(
        events
            .iter()
            .all(|e| e.execution_id == report.context.execution_id)
    );
    Ok(())
}

#[tokio::test]
async fn status_channel_ends_with_the_final_context() -> TestResult {
    init_tracing();
    let control = RunControl::new();
    let (tx, rx) = watch::channel(ExecutionContext::new(
        control.execution_id,
        "p",
        Parameters::new(),
    ));

    let mut executor = LocalExecutor::new(2);
    let report = with_timeout(arithmetic_diamond().execute_with(
        Parameters::new(),
        &mut executor,
        control.with_status(tx),
    ))
    .await?;

    let last = rx.borrow().clone();
    assert_eq!(last.status, Status::Success);
    assert_eq!(last, report.context);
    Ok(())
}

#[tokio::test]
async fn invalid_dag_fails_before_any_task_runs() -> TestResult {
    init_tracing();
    let log = CallLog::new();

    let mut p = Pipeline::new("broken");
    p.add_task(Task::new("A", RecordingWork::new(&log)).after(["missing"]));

    let err = p.execute_local(Parameters::new()).await.unwrap_err();
    assert!(err.to_string().contains("unknown dependency 'missing'"));
    assert!(log.calls().is_empty());
    Ok(())
}
