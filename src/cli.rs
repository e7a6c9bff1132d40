// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde_json::Value;

use crate::types::BackendKind;

/// Command-line arguments for `rundag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "rundag",
    version,
    about = "Run a pipeline of dependent tasks with retries, locally or on a worker pool.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the pipeline file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Rundag.toml")]
    pub config: String,

    /// Parse + validate, print the execution plan, but don't run anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the task graph in Graphviz DOT format and exit.
    #[arg(long)]
    pub dot: bool,

    /// Overrides `[executor].backend`.
    #[arg(long, value_enum, value_name = "BACKEND")]
    pub backend: Option<BackendKind>,

    /// Overrides `[executor].workers`.
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Overrides `[pipeline].max_parallel_tasks`.
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Run parameter, repeatable. Values are parsed as JSON when possible.
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, Value)>,

    /// Append every state transition as a JSON line to this file.
    #[arg(long, value_name = "FILE")]
    pub events: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `RUNDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

/// `key=value`; `value` is JSON if it parses, a string otherwise.
pub fn parse_param(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_prefer_json_values() {
        assert_eq!(parse_param("n=3"), Ok(("n".to_string(), json!(3))));
        assert_eq!(
            parse_param("date=2024-01-01"),
            Ok(("date".to_string(), json!("2024-01-01")))
        );
        assert_eq!(parse_param("q=a=b"), Ok(("q".to_string(), json!("a=b"))));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn flags_parse() {
        let args = CliArgs::try_parse_from([
            "rundag",
            "--config",
            "p.toml",
            "--backend",
            "distributed",
            "--workers",
            "3",
            "--param",
            "day=7",
        ])
        .unwrap();
        assert_eq!(args.config, "p.toml");
        assert_eq!(args.backend, Some(BackendKind::Distributed));
        assert_eq!(args.workers, Some(3));
        assert_eq!(args.params, vec![("day".to_string(), json!(7))]);
    }
}
