// tests/config_errors.rs

mod common;
use crate::common::TestResult;

use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;

use rundag::config::{ConfigFile, load_and_validate};
use rundag::errors::RundagError;
use rundag::types::{BackendKind, ProcessingMode};
use rundag_test_utils::builders::{ConfigFileBuilder, TaskConfigBuilder};

fn write_config(contents: &str) -> Result<NamedTempFile, std::io::Error> {
    let mut file = NamedTempFile::new()?;
    write!(file, "{contents}")?;
    Ok(file)
}

#[test]
fn dag_cycle_returns_structured_error() -> TestResult {
    let file = write_config(
        r#"
[task.A]
cmd = "echo A"
after = ["B"]

[task.B]
cmd = "echo B"
after = ["A"]
"#,
    )?;

    let err = load_and_validate(file.path()).unwrap_err();
    match err {
        RundagError::DagCycle { members } => {
            assert!(members.contains(&"A".to_string()));
            assert!(members.contains(&"B".to_string()));
        }
        other => return Err(format!("expected DagCycle, got {other:?}").into()),
    }
    Ok(())
}

#[test]
fn unknown_dependency_is_reported_with_both_names() -> TestResult {
    let file = write_config(
        r#"
[task.load]
cmd = "echo load"
after = ["extract"]
"#,
    )?;

    let err = load_and_validate(file.path()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "task 'load' has unknown dependency 'extract'"
    );
    Ok(())
}

#[test]
fn file_without_tasks_is_rejected() -> TestResult {
    let file = write_config("[pipeline]\nname = \"empty\"\n")?;
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, RundagError::ConfigError(_)), "{err:?}");
    Ok(())
}

#[test]
fn malformed_toml_is_a_toml_error() -> TestResult {
    let file = write_config("[task.A\ncmd = 1")?;
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, RundagError::TomlError(_)), "{err:?}");
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() -> TestResult {
    let dir = tempfile::tempdir()?;
    let err = load_and_validate(dir.path().join("Rundag.toml")).unwrap_err();
    assert!(matches!(err, RundagError::IoError(_)), "{err:?}");
    Ok(())
}

#[test]
fn bad_durations_name_the_field() -> TestResult {
    let raw = ConfigFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("true").timeout("soon").build())
        .build_raw();
    let err = ConfigFile::try_from(raw).unwrap_err();
    assert!(err.to_string().contains("[task.A].timeout"), "{err}");

    let raw = ConfigFileBuilder::new()
        .with_default_timeout("0s")
        .with_task("A", TaskConfigBuilder::new("true").build())
        .build_raw();
    let err = ConfigFile::try_from(raw).unwrap_err();
    assert!(err.to_string().contains("zero timeout"), "{err}");
    Ok(())
}

#[test]
fn zero_parallelism_and_self_dependency_are_rejected() -> TestResult {
    let raw = ConfigFileBuilder::new()
        .with_max_parallel_tasks(0)
        .with_task("A", TaskConfigBuilder::new("true").build())
        .build_raw();
    assert!(ConfigFile::try_from(raw).is_err());

    let raw = ConfigFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("true").after("A").build())
        .build_raw();
    let err = ConfigFile::try_from(raw).unwrap_err();
    assert!(err.to_string().contains("cannot depend on itself"), "{err}");
    Ok(())
}

#[test]
fn defaults_and_overrides_are_resolved() -> TestResult {
    let file = write_config(
        r#"
[pipeline]
name = "nightly"
processing_mode = "micro_batch"
max_parallel_tasks = 2

[retry]
base_delay = "250ms"
max_delay = "4s"
jitter = false

[executor]
backend = "distributed"
workers = 3

[default]
timeout = "30s"
max_retries = 1

[task.extract]
cmd = "echo extract"

[task.load]
cmd = "echo load"
after = ["extract"]
timeout = "2m"
max_retries = 4
"#,
    )?;

    let cfg = load_and_validate(file.path())?;
    assert_eq!(cfg.pipeline.name, "nightly");
    assert_eq!(cfg.pipeline.processing_mode, ProcessingMode::MicroBatch);
    assert_eq!(cfg.pipeline.max_parallel_tasks, 2);
    assert_eq!(cfg.executor.backend, BackendKind::Distributed);
    assert_eq!(cfg.executor.workers, 3);
    assert_eq!(cfg.retry.base_delay, Duration::from_millis(250));
    assert_eq!(cfg.retry.max_delay, Duration::from_secs(4));
    assert!(!cfg.retry.jitter);

    let extract = &cfg.task["extract"];
    assert_eq!(extract.timeout, Duration::from_secs(30));
    assert_eq!(extract.max_retries, 1);

    let load = &cfg.task["load"];
    assert_eq!(load.timeout, Duration::from_secs(120));
    assert_eq!(load.max_retries, 4);
    assert_eq!(load.after, ["extract"]);
    Ok(())
}

#[test]
fn retry_max_below_base_is_rejected() -> TestResult {
    let file = write_config(
        r#"
[retry]
base_delay = "10s"
max_delay = "1s"

[task.A]
cmd = "true"
"#,
    )?;
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(err.to_string().contains("[retry].max_delay"), "{err}");
    Ok(())
}
