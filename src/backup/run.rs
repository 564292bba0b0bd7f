use super::artifact::Artifact;
use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// States of one orchestration cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Dumping,
    Storing,
    Pruning,
    RetryPending,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunState::Idle => "idle",
            RunState::Dumping => "dumping",
            RunState::Storing => "storing",
            RunState::Pruning => "pruning",
            RunState::RetryPending => "retry_pending",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// A non-retryable error ended the cycle.
    Failed(FailureKind),
    /// Retryable errors used up the retry budget.
    RetriesExhausted(FailureKind),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }

    /// Process exit status for scripted callers.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed(kind) | RunOutcome::RetriesExhausted(kind) => match kind {
                FailureKind::Config => 2,
                FailureKind::Dump => 3,
                FailureKind::Store => 4,
                FailureKind::Cancelled => 130,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneFailure {
    pub name: String,
    pub error: String,
}

/// What happened during one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub job: String,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    pub attempts: u32,

    pub outcome: RunOutcome,

    pub error: Option<String>,

    pub artifact: Option<Artifact>,

    pub pruned: Vec<String>,

    pub prune_failures: Vec<PruneFailure>,
}

impl RunRecord {
    pub fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunOutcome::Succeeded.exit_code(), 0);
        assert_eq!(RunOutcome::Failed(FailureKind::Config).exit_code(), 2);
        assert_eq!(RunOutcome::RetriesExhausted(FailureKind::Dump).exit_code(), 3);
        assert_eq!(RunOutcome::Failed(FailureKind::Store).exit_code(), 4);
        assert_eq!(RunOutcome::Failed(FailureKind::Cancelled).exit_code(), 130);
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Done.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::RetryPending.is_terminal());
    }

    #[test]
    fn test_outcome_serializes_with_kind() {
        let json = serde_json::to_value(RunOutcome::RetriesExhausted(FailureKind::Dump)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "retries_exhausted", "kind": "dump"}));
    }
}
