// src/config/mod.rs

//! Pipeline file loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate it into a [`ConfigFile`] (`validate.rs`).
//! - Turn a validated file into a runnable [`Pipeline`](crate::engine::Pipeline)
//!   (`pipeline.rs`).

pub mod duration;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod validate;

pub use duration::parse_duration;
pub use loader::{load_and_validate, load_from_path};
pub use model::{
    ConfigFile, DefaultSection, ExecutorSection, PipelineSection, RawConfigFile, ResolvedTask,
    RetrySection, TaskConfig,
};
