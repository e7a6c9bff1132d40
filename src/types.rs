// src/types.rs

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How a pipeline consumes its sources.
///
/// The engine schedules every mode the same way (one DAG run per
/// execution); the mode is carried on the pipeline and recorded in the
/// execution parameters so connectors can adapt their reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    Batch,
    Streaming,
    MicroBatch,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Batch => "batch",
            ProcessingMode::Streaming => "streaming",
            ProcessingMode::MicroBatch => "micro_batch",
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "batch" => Ok(ProcessingMode::Batch),
            "streaming" => Ok(ProcessingMode::Streaming),
            "micro_batch" | "micro-batch" => Ok(ProcessingMode::MicroBatch),
            other => Err(format!(
                "invalid processing_mode: {other} (expected \"batch\", \"streaming\" or \"micro_batch\")"
            )),
        }
    }
}

/// Which executor backend runs the tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Bounded tokio worker pool inside this process.
    #[default]
    Local,
    /// Serialized work queue drained by a pool of workers.
    Distributed,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Distributed => f.write_str("distributed"),
        }
    }
}
