use super::artifact::{artifact_name, Artifact, Clock, SystemClock};
use super::backoff::RetryPolicy;
use super::compression::compress;
use super::retention::{prune_store, RetentionPolicy};
use super::run::{PruneFailure, RunOutcome, RunRecord, RunState};
use crate::config::{AppConfig, OverlapPolicy};
use crate::database::{DumpSource, DumpStream};
use crate::error::{BackupError, DumpError};
use crate::notify::{broadcast, EventSink, RunEvent};
use crate::shutdown::Shutdown;
use crate::storage::ArtifactStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Drives backup cycles for one job and guarantees they never overlap.
pub struct Orchestrator {
    config: Arc<AppConfig>,
    source: Arc<dyn DumpSource>,
    store: Arc<dyn ArtifactStore>,
    sinks: Vec<Arc<dyn EventSink>>,
    clock: Arc<dyn Clock>,
    run_lock: Mutex<()>,
    queued: AtomicBool,
}

/// Mutable bookkeeping for the cycle in progress.
struct Cycle {
    attempts: u32,
    stream: Option<DumpStream>,
    artifact: Option<Artifact>,
    error: Option<BackupError>,
    pruned: Vec<String>,
    prune_failures: Vec<PruneFailure>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        source: Arc<dyn DumpSource>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            sinks: Vec::new(),
            clock: Arc::new(SystemClock),
            run_lock: Mutex::new(()),
            queued: AtomicBool::new(false),
        }
    }

    pub fn with_sinks(mut self, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        self.sinks = sinks;
        self
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn job(&self) -> &str {
        self.config.job_name()
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Requests a cycle, honouring the overlap policy.
    ///
    /// Returns `None` when the trigger was dropped, or coalesced into a run
    /// that is already waiting.
    pub async fn trigger(&self, shutdown: &Shutdown) -> Option<RunRecord> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => match self.config.schedule.overlap {
                OverlapPolicy::Drop => {
                    warn!(job = %self.job(), "Backup already running, dropping trigger");
                    return None;
                }
                OverlapPolicy::Queue => {
                    if self.queued.swap(true, Ordering::SeqCst) {
                        info!(job = %self.job(), "Backup already queued, coalescing trigger");
                        return None;
                    }
                    info!(job = %self.job(), "Backup already running, queueing trigger");
                    let guard = self.run_lock.lock().await;
                    self.queued.store(false, Ordering::SeqCst);
                    guard
                }
            },
        };

        if shutdown.is_cancelled() {
            return None;
        }
        Some(self.execute(shutdown).await)
    }

    async fn execute(&self, shutdown: &Shutdown) -> RunRecord {
        let started_at = self.clock.now();
        let retry = RetryPolicy::from(&self.config.retry);
        let mut cycle = Cycle {
            attempts: 0,
            stream: None,
            artifact: None,
            error: None,
            pruned: Vec::new(),
            prune_failures: Vec::new(),
        };

        let mut state = RunState::Idle;
        while !state.is_terminal() {
            let next = match state {
                RunState::Idle => RunState::Dumping,
                RunState::Dumping => self.dump(&mut cycle, &retry, shutdown).await,
                RunState::Storing => self.write(&mut cycle, &retry, shutdown).await,
                RunState::RetryPending => self.wait_for_retry(&mut cycle, &retry, shutdown).await,
                RunState::Pruning => {
                    self.prune(&mut cycle).await;
                    RunState::Done
                }
                RunState::Done | RunState::Failed => state,
            };
            self.transition(state, next, cycle.attempts).await;
            state = next;
        }

        let outcome = match (&state, &cycle.error) {
            (RunState::Done, _) => RunOutcome::Succeeded,
            (_, Some(err)) if err.is_retryable() => {
                RunOutcome::RetriesExhausted(err.failure_kind())
            }
            (_, Some(err)) => RunOutcome::Failed(err.failure_kind()),
            (_, None) => RunOutcome::Failed(crate::error::FailureKind::Dump),
        };

        let record = RunRecord {
            job: self.job().to_string(),
            started_at,
            finished_at: self.clock.now(),
            attempts: cycle.attempts,
            outcome,
            error: cycle.error.as_ref().map(|e| e.to_string()),
            artifact: cycle.artifact,
            pruned: cycle.pruned,
            prune_failures: cycle.prune_failures,
        };
        broadcast(&self.sinks, &RunEvent::Finished(record.clone())).await;
        record
    }

    async fn transition(&self, from: RunState, to: RunState, attempt: u32) {
        let event = RunEvent::Transition {
            job: self.job().to_string(),
            from,
            to,
            attempt,
        };
        broadcast(&self.sinks, &event).await;
    }

    async fn dump(&self, cycle: &mut Cycle, retry: &RetryPolicy, shutdown: &Shutdown) -> RunState {
        cycle.attempts += 1;
        let timeout = self.config.dump.timeout();
        info!(
            job = %self.job(),
            attempt = cycle.attempts,
            tool = self.source.tool_name(),
            "Dumping {}",
            self.config.database.name
        );

        match self.source.run(&self.config.database, timeout, shutdown).await {
            Ok(stream) => {
                cycle.stream = Some(compress(stream, self.config.dump.compression));
                RunState::Storing
            }
            Err(e) => self.fail(cycle, e.into(), retry, shutdown),
        }
    }

    async fn write(&self, cycle: &mut Cycle, retry: &RetryPolicy, shutdown: &Shutdown) -> RunState {
        let Some(stream) = cycle.stream.take() else {
            return RunState::Dumping;
        };
        let name = artifact_name(
            &self.config.dump.name_template,
            &self.config.database.name,
            self.clock.now(),
            self.config.database.format,
            self.config.dump.compression,
        );

        match self.store.write(&name, stream).await {
            Ok(artifact) => {
                info!(
                    job = %self.job(),
                    artifact = %artifact.name,
                    size = artifact.size,
                    backend = self.store.name(),
                    "Stored artifact in {}",
                    self.store.location()
                );
                cycle.artifact = Some(artifact);
                cycle.error = None;
                RunState::Pruning
            }
            Err(e) => self.fail(cycle, e, retry, shutdown),
        }
    }

    fn fail(
        &self,
        cycle: &mut Cycle,
        err: BackupError,
        retry: &RetryPolicy,
        shutdown: &Shutdown,
    ) -> RunState {
        let next = if err.is_retryable()
            && retry.allows_retry(cycle.attempts)
            && !shutdown.is_cancelled()
        {
            RunState::RetryPending
        } else {
            RunState::Failed
        };
        cycle.error = Some(err);
        next
    }

    async fn wait_for_retry(
        &self,
        cycle: &mut Cycle,
        retry: &RetryPolicy,
        shutdown: &Shutdown,
    ) -> RunState {
        let delay = retry.delay(cycle.attempts);
        let event = RunEvent::RetryScheduled {
            job: self.job().to_string(),
            attempt: cycle.attempts,
            delay_secs: delay.as_secs_f64(),
            error: cycle
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
        };
        broadcast(&self.sinks, &event).await;

        tokio::select! {
            _ = tokio::time::sleep(delay) => RunState::Dumping,
            _ = shutdown.cancelled() => {
                cycle.error = Some(DumpError::Cancelled.into());
                RunState::Failed
            }
        }
    }

    async fn prune(&self, cycle: &mut Cycle) {
        let policy = RetentionPolicy::from(&self.config.retention);
        if policy.is_empty() {
            return;
        }

        let protect = cycle.artifact.as_ref().map(|a| a.name.as_str());
        match prune_store(self.store.as_ref(), &policy, self.clock.now(), protect, false).await {
            Ok(report) => {
                cycle.pruned = report.deleted;
                cycle.prune_failures = report.failures;
            }
            Err(e) => warn!(job = %self.job(), "Skipping retention, listing failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::testing::*;
    use crate::error::{FailureKind, StoreError};
    use crate::shutdown;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn successful_cycle_stores_exactly_one_artifact() {
        let h = harness(
            test_config(3, None, OverlapPolicy::Queue),
            FakeSource::new(vec![Script::Ok(b"full dump")]),
        );

        let record = h.orchestrator.trigger(&Shutdown::never()).await.unwrap();

        assert_eq!(record.outcome, RunOutcome::Succeeded);
        assert_eq!(record.outcome.exit_code(), 0);
        assert_eq!(record.attempts, 1);
        let artifact = record.artifact.unwrap();
        assert_eq!(artifact.name, "shop_2024-06-01_00-00-00.dump");
        assert_eq!(h.store.names(), vec![artifact.name.clone()]);
        assert_eq!(h.store.data(&artifact.name).unwrap(), b"full dump".to_vec());
        assert_eq!(
            h.sink.states(),
            vec![RunState::Dumping, RunState::Storing, RunState::Pruning, RunState::Done]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_exact() {
        let h = harness(
            test_config(2, None, OverlapPolicy::Queue),
            FakeSource::new(vec![
                Script::FailStart(connection_error),
                Script::FailStart(connection_error),
                Script::FailStart(connection_error),
            ]),
        );

        let record = h.orchestrator.trigger(&Shutdown::never()).await.unwrap();

        assert_eq!(record.outcome, RunOutcome::RetriesExhausted(FailureKind::Dump));
        assert_eq!(record.attempts, 3);
        assert_eq!(h.source.calls(), 3);
        assert!(record.error.unwrap().contains("connection refused"));
        assert_eq!(h.sink.states().last(), Some(&RunState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_between_attempts() {
        let h = harness(
            test_config(3, None, OverlapPolicy::Queue),
            FakeSource::new(vec![
                Script::FailStart(tool_error),
                Script::FailStart(tool_error),
                Script::FailStart(tool_error),
                Script::FailStart(tool_error),
            ]),
        );

        let started = tokio::time::Instant::now();
        let record = h.orchestrator.trigger(&Shutdown::never()).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(record.outcome, RunOutcome::RetriesExhausted(FailureKind::Dump));
        assert_eq!(record.attempts, 4);
        assert_eq!(h.sink.retry_delays(), vec![1.0, 2.0, 4.0]);
        assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycle_never_prunes() {
        let h = harness(
            test_config(0, Some(1), OverlapPolicy::Queue),
            FakeSource::new(vec![Script::FailStart(tool_error)]),
        );
        for (i, hours) in [5, 4, 3, 2, 1].iter().enumerate() {
            h.store.seed(&format!("shop_{}.dump", i), *hours);
        }

        let record = h.orchestrator.trigger(&Shutdown::never()).await.unwrap();

        assert!(!record.outcome.is_success());
        assert_eq!(h.store.names().len(), 5);
        assert!(!h.sink.states().contains(&RunState::Pruning));
    }

    #[tokio::test(start_paused = true)]
    async fn mid_stream_failure_leaves_no_artifact_and_retries() {
        let h = harness(
            test_config(1, None, OverlapPolicy::Queue),
            FakeSource::new(vec![Script::FailMidStream(b"half", tool_error), Script::Ok(b"whole")]),
        );

        let record = h.orchestrator.trigger(&Shutdown::never()).await.unwrap();

        assert_eq!(record.outcome, RunOutcome::Succeeded);
        assert_eq!(record.attempts, 2);
        assert!(record.error.is_none());
        let names = h.store.names();
        assert_eq!(names.len(), 1);
        assert_eq!(h.store.data(&names[0]).unwrap(), b"whole".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn quota_exceeded_fails_without_retrying() {
        let h = harness(test_config(3, None, OverlapPolicy::Queue), FakeSource::new(vec![]));
        h.store
            .write_failures
            .lock()
            .unwrap()
            .push_back(StoreError::QuotaExceeded("bucket full".to_string()));

        let record = h.orchestrator.trigger(&Shutdown::never()).await.unwrap();

        assert_eq!(record.outcome, RunOutcome::Failed(FailureKind::Store));
        assert_eq!(record.outcome.exit_code(), 4);
        assert_eq!(record.attempts, 1);
        assert!(h.store.names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn store_unavailable_is_retried() {
        let h = harness(test_config(3, None, OverlapPolicy::Queue), FakeSource::new(vec![]));
        h.store
            .write_failures
            .lock()
            .unwrap()
            .push_back(StoreError::Unavailable("503".to_string()));

        let record = h.orchestrator.trigger(&Shutdown::never()).await.unwrap();

        assert_eq!(record.outcome, RunOutcome::Succeeded);
        assert_eq!(record.attempts, 2);
        assert_eq!(h.store.names().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retention_runs_after_success() {
        let h = harness(test_config(0, Some(3), OverlapPolicy::Queue), FakeSource::new(vec![]));
        for (i, hours) in [5, 4, 3, 2, 1].iter().enumerate() {
            h.store.seed(&format!("t{}.dump", i + 1), *hours);
        }

        let record = h.orchestrator.trigger(&Shutdown::never()).await.unwrap();

        assert_eq!(record.pruned, vec!["t1.dump", "t2.dump", "t3.dump"]);
        let new_name = record.artifact.unwrap().name;
        assert_eq!(h.store.names(), vec!["t4.dump".to_string(), "t5.dump".to_string(), new_name]);
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_failures_do_not_fail_the_cycle() {
        let h = harness(test_config(0, Some(1), OverlapPolicy::Queue), FakeSource::new(vec![]));
        h.store.seed("old1.dump", 2);
        h.store.seed("old2.dump", 1);
        h.store.undeletable.lock().unwrap().insert("old1.dump".to_string());

        let record = h.orchestrator.trigger(&Shutdown::never()).await.unwrap();

        assert_eq!(record.outcome, RunOutcome::Succeeded);
        assert_eq!(record.pruned, vec!["old2.dump"]);
        assert_eq!(record.prune_failures.len(), 1);
        assert_eq!(record.prune_failures[0].name, "old1.dump");
        assert_eq!(h.store.names().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_triggers_are_dropped() {
        let h = harness(
            test_config(0, None, OverlapPolicy::Drop),
            FakeSource::slow(Duration::from_secs(30)),
        );

        let first = tokio::spawn({
            let o = h.orchestrator.clone();
            async move { o.trigger(&Shutdown::never()).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = h.orchestrator.trigger(&Shutdown::never()).await;

        assert!(second.is_none());
        assert!(first.await.unwrap().is_some());
        assert_eq!(h.source.calls(), 1);
        assert_eq!(h.source.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_triggers_are_queued_once() {
        let h = harness(
            test_config(0, None, OverlapPolicy::Queue),
            FakeSource::slow(Duration::from_secs(30)),
        );

        let spawn =
            |o: Arc<Orchestrator>| tokio::spawn(async move { o.trigger(&Shutdown::never()).await });
        let first = spawn(h.orchestrator.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = spawn(h.orchestrator.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let third = spawn(h.orchestrator.clone());

        let (first, second, third) = (
            first.await.unwrap(),
            second.await.unwrap(),
            third.await.unwrap(),
        );
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(third.is_none());
        assert_eq!(h.source.calls(), 2);
        assert_eq!(h.source.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff_ends_cycle() {
        let h = harness(
            test_config(5, None, OverlapPolicy::Queue),
            FakeSource::new(vec![Script::FailStart(connection_error)]),
        );
        let (trigger, shutdown) = shutdown::channel();

        let run = tokio::spawn({
            let o = h.orchestrator.clone();
            async move { o.trigger(&shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();

        let record = run.await.unwrap().unwrap();
        assert_eq!(record.outcome, RunOutcome::Failed(FailureKind::Cancelled));
        assert_eq!(record.outcome.exit_code(), 130);
        assert_eq!(h.source.calls(), 1);
    }
}
