use super::orchestrator::Orchestrator;
use super::run::RunRecord;
use crate::config::ScheduleConfig;
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

/// Fires backup cycles on a fixed interval and on demand.
///
/// Runs are spawned, so a slow backup never delays the next tick; overlap is
/// resolved by the orchestrator's policy.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    run_on_start: bool,
}

pub struct SchedulerHandle {
    triggers: mpsc::Sender<()>,
    stopper: ShutdownTrigger,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Requests an immediate cycle. Returns false if the scheduler is gone
    /// or a manual trigger is already pending.
    pub fn trigger(&self) -> bool {
        self.triggers.try_send(()).is_ok()
    }

    /// Turns every item of `requests` into a manual trigger until `shutdown`
    /// fires. A finished request source just leaves the interval running.
    pub async fn forward<S>(&self, mut requests: S, shutdown: &Shutdown)
    where
        S: Stream<Item = ()> + Unpin,
    {
        let mut open = true;
        loop {
            select! {
                _ = shutdown.cancelled() => break,
                request = requests.next(), if open => match request {
                    Some(()) if self.trigger() => info!("Manual backup requested"),
                    Some(()) => info!("Manual backup already pending, request coalesced"),
                    None => open = false,
                },
            }
        }
    }

    /// Stops scheduling, cancels in-flight work and waits for it to settle.
    pub async fn stop(self) {
        self.stopper.trigger();
        self.wait().await;
    }

    /// Waits until the scheduler stops for any reason.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!("Scheduler task panicked: {}", e);
        }
    }
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration, run_on_start: bool) -> Self {
        Self {
            orchestrator,
            interval,
            run_on_start,
        }
    }

    pub fn from_config(orchestrator: Arc<Orchestrator>, config: &ScheduleConfig) -> Self {
        Self::new(orchestrator, config.interval.as_duration(), config.run_on_start)
    }

    pub fn start(self) -> SchedulerHandle {
        let (stopper, shutdown) = shutdown::channel();
        let (triggers, rx) = mpsc::channel(1);
        let task = tokio::spawn(self.run(rx, shutdown));

        SchedulerHandle {
            triggers,
            stopper,
            task,
        }
    }

    async fn run(self, mut triggers: mpsc::Receiver<()>, shutdown: Shutdown) {
        let job = self.orchestrator.job().to_string();
        info!(
            job = %job,
            "Starting backup scheduler, interval: {} seconds",
            self.interval.as_secs()
        );

        let first = if self.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut runs: JoinSet<Option<RunRecord>> = JoinSet::new();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    info!(job = %job, "Scheduler shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.spawn_run(&mut runs, &shutdown, "interval");
                }
                Some(()) = triggers.recv() => {
                    self.spawn_run(&mut runs, &shutdown, "manual");
                }
                Some(joined) = runs.join_next() => report(joined),
            }
        }

        if !runs.is_empty() {
            info!(job = %job, "Waiting for {} in-flight run(s)", runs.len());
        }
        while let Some(joined) = runs.join_next().await {
            report(joined);
        }
        info!(job = %job, "Scheduler stopped");
    }

    fn spawn_run(
        &self,
        runs: &mut JoinSet<Option<RunRecord>>,
        shutdown: &Shutdown,
        reason: &'static str,
    ) {
        let orchestrator = self.orchestrator.clone();
        let shutdown = shutdown.clone();
        info!(job = %orchestrator.job(), trigger = reason, "Backup triggered");
        runs.spawn(async move { orchestrator.trigger(&shutdown).await });
    }
}

// Outcomes are reported by the event sinks; only task failures surface here.
fn report(joined: Result<Option<RunRecord>, tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Backup task aborted: {}", e);
    }
}
