// src/work/connector.rs

//! Data connectors and transformations, and the task work that adapts them
//! to the engine.
//!
//! Rows travel between tasks as JSON arrays of objects. A transformation or
//! sink with several upstream tasks sees their rows concatenated in
//! upstream-name order.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::errors::TaskError;
use crate::work::{Parameters, TaskInput, TaskWork, WorkContext};

pub type Row = Map<String, Value>;
pub type Rows = Vec<Row>;

/// Where and how to read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

/// Where and how to write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl SourceConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: BTreeMap::new(),
        }
    }
}

impl DestinationConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: BTreeMap::new(),
        }
    }
}

/// Acknowledgement of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub rows_written: usize,
}

#[async_trait]
pub trait Connector: Send + Sync + Debug {
    async fn read(&self, source: &SourceConfig) -> anyhow::Result<Rows>;
    async fn write(&self, rows: Rows, destination: &DestinationConfig) -> anyhow::Result<Ack>;
}

pub trait Transformation: Send + Sync + Debug {
    fn apply(&self, rows: Rows, parameters: &Parameters) -> anyhow::Result<Rows>;
}

/// Reads rows from a connector.
#[derive(Debug, Clone)]
pub struct SourceWork {
    connector: Arc<dyn Connector>,
    source: SourceConfig,
}

impl SourceWork {
    pub fn new(connector: Arc<dyn Connector>, source: SourceConfig) -> Self {
        Self { connector, source }
    }
}

#[async_trait]
impl TaskWork for SourceWork {
    async fn run(&self, ctx: WorkContext) -> Result<Value, TaskError> {
        let rows = tokio::select! {
            rows = self.connector.read(&self.source) => rows?,
            _ = ctx.cancel.cancelled() => return Err(TaskError::Cancelled),
        };
        Ok(rows_to_value(rows))
    }

    fn describe(&self) -> String {
        format!("source {}", self.source.name)
    }
}

/// Applies a transformation to the concatenated upstream rows.
#[derive(Debug, Clone)]
pub struct TransformWork {
    transformation: Arc<dyn Transformation>,
}

impl TransformWork {
    pub fn new(transformation: Arc<dyn Transformation>) -> Self {
        Self { transformation }
    }
}

#[async_trait]
impl TaskWork for TransformWork {
    async fn run(&self, ctx: WorkContext) -> Result<Value, TaskError> {
        let rows = collect_rows(&ctx.inputs)?;
        let out = self.transformation.apply(rows, &ctx.parameters)?;
        Ok(rows_to_value(out))
    }

    fn describe(&self) -> String {
        format!("transform {:?}", self.transformation)
    }
}

/// Writes the concatenated upstream rows to a connector.
#[derive(Debug, Clone)]
pub struct SinkWork {
    connector: Arc<dyn Connector>,
    destination: DestinationConfig,
}

impl SinkWork {
    pub fn new(connector: Arc<dyn Connector>, destination: DestinationConfig) -> Self {
        Self {
            connector,
            destination,
        }
    }
}

#[async_trait]
impl TaskWork for SinkWork {
    async fn run(&self, ctx: WorkContext) -> Result<Value, TaskError> {
        let rows = collect_rows(&ctx.inputs)?;
        let ack = tokio::select! {
            ack = self.connector.write(rows, &self.destination) => ack?,
            _ = ctx.cancel.cancelled() => return Err(TaskError::Cancelled),
        };
        Ok(json!({ "rows_written": ack.rows_written }))
    }

    fn describe(&self) -> String {
        format!("sink {}", self.destination.name)
    }
}

fn rows_to_value(rows: Rows) -> Value {
    Value::Array(rows.into_iter().map(Value::Object).collect())
}

/// Concatenate upstream outputs. `null` outputs contribute nothing.
pub fn collect_rows(inputs: &TaskInput) -> Result<Rows, TaskError> {
    let mut rows = Rows::new();
    for (upstream, value) in inputs {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::Object(row) => rows.push(row.clone()),
                        other => {
                            return Err(TaskError::Failure(format!(
                                "upstream '{upstream}' produced a non-object row: {other}"
                            )));
                        }
                    }
                }
            }
            Value::Object(row) => rows.push(row.clone()),
            other => {
                return Err(TaskError::Failure(format!(
                    "upstream '{upstream}' did not produce rows: {other}"
                )));
            }
        }
    }
    Ok(rows)
}
