// src/state/mod.rs

//! Execution state: statuses, records, the state machine that mutates them
//! and the retry controller that decides when a failed attempt runs again.

pub mod context;
pub mod machine;
pub mod retry;
pub mod status;

pub use context::{ExecutionContext, TaskRun};
pub use machine::StateMachine;
pub use retry::{MAX_RETRY_DELAY, RetryController, RetryPolicy};
pub use status::Status;
