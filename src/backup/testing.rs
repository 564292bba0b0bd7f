//! Test doubles shared by the orchestrator and scheduler tests.

use super::artifact::{Artifact, Clock, ManualClock};
use super::orchestrator::Orchestrator;
use super::run::RunState;
use crate::config::{
    AppConfig, Compression, DatabaseConfig, OverlapPolicy, RetentionConfig, RetryConfig,
    StorageConfig,
};
use crate::database::{DumpSource, DumpStream};
use crate::error::{DumpError, Result, StoreError};
use crate::notify::{EventSink, RunEvent};
use crate::shutdown::Shutdown;
use crate::storage::ArtifactStore;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

pub enum Script {
    Ok(&'static [u8]),
    FailStart(fn() -> DumpError),
    FailMidStream(&'static [u8], fn() -> DumpError),
}

/// Plays back scripted dump outcomes; once exhausted every run succeeds.
pub struct FakeSource {
    script: StdMutex<VecDeque<Script>>,
    calls: AtomicUsize,
    active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
    hold: Duration,
}

impl FakeSource {
    pub fn new(script: Vec<Script>) -> Self {
        Self {
            script: StdMutex::new(script.into()),
            calls: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            hold: Duration::ZERO,
        }
    }

    pub fn slow(hold: Duration) -> Self {
        Self { hold, ..Self::new(vec![]) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DumpSource for FakeSource {
    async fn run(
        &self,
        _target: &DatabaseConfig,
        _timeout: Duration,
        _shutdown: &Shutdown,
    ) -> std::result::Result<DumpStream, DumpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Script::Ok(b"PGDMP"));

        let items: Vec<std::result::Result<Vec<u8>, DumpError>> = match step {
            Script::FailStart(make) => return Err(make()),
            Script::Ok(data) => vec![Ok(data.to_vec())],
            Script::FailMidStream(data, make) => vec![Ok(data.to_vec()), Err(make())],
        };

        let active = self.active.clone();
        let max_active = self.max_active.clone();
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        max_active.fetch_max(now, Ordering::SeqCst);
        let hold = self.hold;

        let body = futures::stream::once(async move {
            tokio::time::sleep(hold).await;
            futures::stream::iter(items)
        })
        .flatten()
        .chain(futures::stream::once(async move {
            active.fetch_sub(1, Ordering::SeqCst);
            None
        })
        .filter_map(|x: Option<std::result::Result<Vec<u8>, DumpError>>| async move { x }));
        Ok(body.boxed())
    }

    fn tool_name(&self) -> &'static str {
        "fake"
    }
}

/// In-memory store with injectable failures.
pub struct MemoryStore {
    clock: Arc<ManualClock>,
    artifacts: StdMutex<Vec<(Artifact, Vec<u8>)>>,
    pub write_failures: StdMutex<VecDeque<StoreError>>,
    pub undeletable: StdMutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            artifacts: StdMutex::new(Vec::new()),
            write_failures: StdMutex::new(VecDeque::new()),
            undeletable: StdMutex::new(HashSet::new()),
        }
    }

    pub fn seed(&self, name: &str, hours_ago: i64) {
        let artifact = Artifact {
            name: name.to_string(),
            size: 4,
            created_at: self.clock.now() - chrono::Duration::hours(hours_ago),
            location: format!("mem://{}", name),
            checksum: None,
        };
        self.artifacts.lock().unwrap().push((artifact, b"old!".to_vec()));
    }

    pub fn names(&self) -> Vec<String> {
        let mut all: Vec<Artifact> =
            self.artifacts.lock().unwrap().iter().map(|(a, _)| a.clone()).collect();
        all.sort_by_key(|a| a.created_at);
        all.into_iter().map(|a| a.name).collect()
    }

    pub fn data(&self, name: &str) -> Option<Vec<u8>> {
        self.artifacts
            .lock()
            .unwrap()
            .iter()
            .find(|(a, _)| a.name == name)
            .map(|(_, d)| d.clone())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn write(&self, name: &str, mut stream: DumpStream) -> Result<Artifact> {
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend(chunk?);
        }
        if let Some(err) = self.write_failures.lock().unwrap().pop_front() {
            return Err(err.into());
        }
        let artifact = Artifact {
            name: name.to_string(),
            size: data.len() as u64,
            created_at: self.clock.now(),
            location: format!("mem://{}", name),
            checksum: None,
        };
        self.artifacts.lock().unwrap().push((artifact.clone(), data));
        Ok(artifact)
    }

    async fn list(&self) -> Result<Vec<Artifact>> {
        let mut all: Vec<Artifact> =
            self.artifacts.lock().unwrap().iter().map(|(a, _)| a.clone()).collect();
        all.sort_by_key(|a| a.created_at);
        Ok(all)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if self.undeletable.lock().unwrap().contains(name) {
            return Err(StoreError::Unavailable("delete refused".to_string()).into());
        }
        self.artifacts.lock().unwrap().retain(|(a, _)| a.name != name);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn location(&self) -> String {
        "mem://".to_string()
    }
}

/// Records every event it sees.
#[derive(Default)]
pub struct RecordingSink {
    events: StdMutex<Vec<RunEvent>>,
}

impl RecordingSink {
    pub fn states(&self) -> Vec<RunState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                RunEvent::Transition { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    pub fn retry_delays(&self) -> Vec<f64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                RunEvent::RetryScheduled { delay_secs, .. } => Some(*delay_secs),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: &RunEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

pub fn test_config(
    max_retries: u32,
    keep_count: Option<usize>,
    overlap: OverlapPolicy,
) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.name = "shop".to_string();
    config.dump.compression = Compression::None;
    config.storage = StorageConfig::Local { directory: "unused".into() };
    config.retry = RetryConfig {
        max_retries,
        backoff_base_secs: 1,
        backoff_cap_secs: 8,
    };
    config.retention = RetentionConfig {
        keep_count,
        max_age: None,
        keep_latest: true,
    };
    config.schedule.overlap = overlap;
    config
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub source: Arc<FakeSource>,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<RecordingSink>,
}

pub fn harness(config: AppConfig, source: FakeSource) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let source = Arc::new(source);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let sink = Arc::new(RecordingSink::default());
    let orchestrator = Orchestrator::new(Arc::new(config), source.clone(), store.clone())
        .with_sinks(vec![sink.clone()])
        .with_clock(clock);
    Harness {
        orchestrator: Arc::new(orchestrator),
        source,
        store,
        sink,
    }
}

pub fn connection_error() -> DumpError {
    DumpError::Connection("connection refused".to_string())
}

pub fn tool_error() -> DumpError {
    DumpError::Tool { code: Some(1), stderr: "pg_dump: error".to_string() }
}