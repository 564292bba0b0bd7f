use crate::backup::{RunRecord, RunState};
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

/// Something worth reporting while a cycle runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Transition {
        job: String,
        from: RunState,
        to: RunState,
        attempt: u32,
    },
    RetryScheduled {
        job: String,
        attempt: u32,
        delay_secs: f64,
        error: String,
    },
    Finished(RunRecord),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &RunEvent) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Reports events through `tracing`.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: &RunEvent) -> Result<()> {
        match event {
            RunEvent::Transition { job, from, to, attempt } => {
                info!(job = %job, attempt, from = %from, to = %to, "state transition");
            }
            RunEvent::RetryScheduled { job, attempt, delay_secs, error } => {
                warn!(
                    job = %job,
                    attempt,
                    "attempt failed: {}; retrying in {:.1}s",
                    error,
                    delay_secs
                );
            }
            RunEvent::Finished(record) if record.outcome.is_success() => {
                let artifact = record.artifact.as_ref().map(|a| a.name.as_str()).unwrap_or("-");
                info!(
                    job = %record.job,
                    attempts = record.attempts,
                    artifact,
                    pruned = record.pruned.len(),
                    "backup completed in {}s",
                    record.duration_secs()
                );
            }
            RunEvent::Finished(record) => {
                error!(
                    job = %record.job,
                    attempts = record.attempts,
                    exit_code = record.outcome.exit_code(),
                    "backup failed: {}",
                    record.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Fans an event out to every sink; sink failures are logged and ignored.
pub async fn broadcast(sinks: &[std::sync::Arc<dyn EventSink>], event: &RunEvent) {
    for sink in sinks {
        if let Err(e) = sink.emit(event).await {
            warn!("Event sink {} failed: {}", sink.name(), e);
        }
    }
}
