// src/config/validate.rs

use std::collections::BTreeMap;

use crate::config::duration::parse_duration;
use crate::config::model::{ConfigFile, RawConfigFile, ResolvedTask};
use crate::dag::graph::find_cycle;
use crate::errors::{Result, RundagError};
use crate::state::RetryPolicy;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = RundagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_tasks(&raw)?;
        validate_pipeline_config(&raw)?;
        validate_task_dependencies(&raw)?;
        validate_dag(&raw)?;

        let retry = resolve_retry(&raw)?;
        let tasks = resolve_tasks(&raw)?;
        Ok(ConfigFile::new_unchecked(
            raw.pipeline,
            retry,
            raw.executor,
            tasks,
        ))
    }
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(RundagError::ConfigError(
            "config must contain at least one [task.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_pipeline_config(cfg: &RawConfigFile) -> Result<()> {
    if cfg.pipeline.max_parallel_tasks == 0 {
        return Err(RundagError::ConfigError(
            "[pipeline].max_parallel_tasks must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.executor.workers == 0 {
        return Err(RundagError::ConfigError(
            "[executor].workers must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_task_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for (name, task) in cfg.task.iter() {
        if task.cmd.trim().is_empty() {
            return Err(RundagError::ConfigError(format!(
                "task '{name}' has an empty `cmd`"
            )));
        }
        for dep in task.after.iter() {
            if dep == name {
                return Err(RundagError::ConfigError(format!(
                    "task '{name}' cannot depend on itself in `after`"
                )));
            }
            if !cfg.task.contains_key(dep) {
                return Err(RundagError::UnknownDependency {
                    task: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    let deps: BTreeMap<&str, Vec<&str>> = cfg
        .task
        .iter()
        .map(|(name, task)| {
            (
                name.as_str(),
                task.after.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    match find_cycle(&deps) {
        Some(members) => Err(RundagError::DagCycle { members }),
        None => Ok(()),
    }
}

fn resolve_retry(cfg: &RawConfigFile) -> Result<RetryPolicy> {
    let base_delay = duration_field("[retry].base_delay", &cfg.retry.base_delay)?;
    let max_delay = duration_field("[retry].max_delay", &cfg.retry.max_delay)?;
    if max_delay < base_delay {
        return Err(RundagError::ConfigError(format!(
            "[retry].max_delay ({}) must not be smaller than base_delay ({})",
            cfg.retry.max_delay, cfg.retry.base_delay
        )));
    }
    Ok(RetryPolicy {
        base_delay,
        max_delay,
        jitter: cfg.retry.jitter,
    })
}

fn resolve_tasks(cfg: &RawConfigFile) -> Result<BTreeMap<String, ResolvedTask>> {
    let default_timeout = duration_field("[default].timeout", &cfg.default.timeout)?;

    cfg.task
        .iter()
        .map(|(name, task)| {
            let timeout = match &task.timeout {
                Some(raw) => duration_field(&format!("[task.{name}].timeout"), raw)?,
                None => default_timeout,
            };
            if timeout.is_zero() {
                return Err(RundagError::ConfigError(format!(
                    "task '{name}' has a zero timeout"
                )));
            }
            Ok((
                name.clone(),
                ResolvedTask {
                    cmd: task.cmd.clone(),
                    after: task.after.clone(),
                    timeout,
                    max_retries: task.max_retries.unwrap_or(cfg.default.max_retries),
                },
            ))
        })
        .collect()
}

fn duration_field(field: &str, raw: &str) -> Result<std::time::Duration> {
    parse_duration(raw).map_err(|e| RundagError::ConfigError(format!("{field}: {e}")))
}
