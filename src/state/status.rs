// src/state/status.rs

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status shared by `ExecutionContext` and `TaskRun`.
///
/// Legal transitions:
///
/// ```text
/// pending -> running -> success | failed | cancelled
/// pending -> cancelled
/// failed  -> retry -> running
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Retry,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
            Status::Retry => "retry",
        }
    }

    /// Whether `self -> next` is an edge of the status graph.
    ///
    /// `failed -> retry` is only an edge; whether attempts remain is decided
    /// by the retry controller before the transition is requested.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Retry)
                | (Retry, Running)
        )
    }

    /// Terminal for an execution as a whole. A task-level `failed` may still
    /// move to `retry`; see [`Status::can_transition_to`].
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failed | Status::Cancelled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_edges_are_legal() {
        assert!(Status::Pending.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::Success));
        assert!(Status::Running.can_transition_to(Status::Failed));
        assert!(Status::Failed.can_transition_to(Status::Retry));
        assert!(Status::Retry.can_transition_to(Status::Running));
    }

    #[test]
    fn terminal_states_do_not_move_forward() {
        for next in [
            Status::Pending,
            Status::Running,
            Status::Failed,
            Status::Cancelled,
            Status::Retry,
        ] {
            assert!(!Status::Success.can_transition_to(next));
            assert!(!Status::Cancelled.can_transition_to(next));
        }
        assert!(!Status::Failed.can_transition_to(Status::Running));
        assert!(!Status::Pending.can_transition_to(Status::Success));
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&Status::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }
}
