pub mod artifact;
pub mod backoff;
pub mod compression;
pub mod orchestrator;
pub mod retention;
pub mod run;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use artifact::{is_artifact_name, Artifact, Clock, SystemClock};
pub use orchestrator::Orchestrator;
pub use run::{RunOutcome, RunRecord, RunState};
pub use scheduler::Scheduler;
