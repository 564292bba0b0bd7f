use crate::backup::retention::{prune_store, RetentionPolicy};
use crate::backup::{Artifact, Clock, Orchestrator, RunRecord, Scheduler, SystemClock};
use crate::config::{self, AppConfig, Compression};
use crate::database;
use crate::error::{BackupError, Result};
use crate::notify;
use crate::shutdown::Shutdown;
use crate::storage;
use console::style;
use futures::stream::{self, BoxStream, StreamExt};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

async fn build(config: Arc<AppConfig>) -> Result<Orchestrator> {
    let source = database::create_source(&config.dump)?;
    let store = storage::create_store(&config.storage).await?;
    let sinks = notify::create_sinks(&config.notify)?;
    Ok(Orchestrator::new(config, source, store).with_sinks(sinks))
}

fn megabytes(size: u64) -> f64 {
    size as f64 / 1024.0 / 1024.0
}

fn print_artifact(artifact: &Artifact) {
    println!(
        "  {}  {:>10.2} MB  {}",
        style(artifact.created_at.format("%Y-%m-%d %H:%M:%S UTC")).dim(),
        megabytes(artifact.size),
        artifact.name
    );
}

fn print_record(record: &RunRecord) {
    if record.outcome.is_success() {
        println!(
            "{} Backup of {} completed in {} sec ({} attempt(s))",
            style("✓").green(),
            record.job,
            record.duration_secs(),
            record.attempts
        );
    } else {
        println!(
            "{} Backup of {} failed after {} attempt(s): {}",
            style("✗").red(),
            record.job,
            record.attempts,
            record.error.as_deref().unwrap_or("unknown error")
        );
    }

    if let Some(artifact) = &record.artifact {
        print_artifact(artifact);
        if let Some(checksum) = &artifact.checksum {
            println!("  sha256: {}", style(checksum).dim());
        }
    }
    for name in &record.pruned {
        println!("  pruned: {}", name);
    }
    for failure in &record.prune_failures {
        println!("  {} could not delete {}: {}", style("!").yellow(), failure.name, failure.error);
    }
}

pub async fn run(path: Option<&Path>, shutdown: &Shutdown) -> Result<i32> {
    let config = Arc::new(config::load(path)?);
    let orchestrator = build(config).await?;

    match orchestrator.trigger(shutdown).await {
        Some(record) => {
            print_record(&record);
            Ok(record.outcome.exit_code())
        }
        // only when interrupted before the cycle started
        None => Ok(130),
    }
}

pub async fn daemon(path: Option<&Path>, shutdown: &Shutdown) -> Result<i32> {
    let config = Arc::new(config::load(path)?);
    let orchestrator = Arc::new(build(config.clone()).await?);

    info!(
        job = %config.job_name(),
        "Backing up {} to {} ({})",
        config.database.name,
        orchestrator.store().location(),
        config.schedule.interval
    );

    let handle = Scheduler::from_config(orchestrator, &config.schedule).start();
    handle.forward(manual_requests()?, shutdown).await;

    println!("{}", style("Stopping scheduler...").yellow());
    handle.stop().await;
    Ok(0)
}

/// SIGUSR1 asks the daemon for an immediate backup.
#[cfg(unix)]
fn manual_requests() -> Result<BoxStream<'static, ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let signals = signal(SignalKind::user_defined1())?;
    info!("Send SIGUSR1 to pid {} for an immediate backup", std::process::id());
    Ok(stream::unfold(signals, |mut signals| async move {
        signals.recv().await.map(|()| ((), signals))
    })
    .boxed())
}

#[cfg(not(unix))]
fn manual_requests() -> Result<BoxStream<'static, ()>> {
    Ok(stream::pending().boxed())
}

pub async fn list(path: Option<&Path>) -> Result<i32> {
    let config = config::load(path)?;
    let store = storage::create_store(&config.storage).await?;
    let artifacts = store.list().await?;

    println!("{} {}", style("Artifacts in").bold(), style(store.location()).cyan());
    if artifacts.is_empty() {
        println!("  {}", style("No artifacts yet").dim());
        return Ok(0);
    }

    for artifact in &artifacts {
        print_artifact(artifact);
    }
    let total: u64 = artifacts.iter().map(|a| a.size).sum();
    println!("{} artifact(s), {:.2} MB total", artifacts.len(), megabytes(total));
    Ok(0)
}

pub async fn prune(path: Option<&Path>, dry_run: bool) -> Result<i32> {
    let config = config::load(path)?;
    let policy = RetentionPolicy::from(&config.retention);
    if policy.is_empty() {
        println!("{}", style("No retention rule configured, nothing to prune").yellow());
        return Ok(0);
    }

    let store = storage::create_store(&config.storage).await?;
    let report = prune_store(store.as_ref(), &policy, SystemClock.now(), None, dry_run).await?;

    if report.selected.is_empty() {
        println!("{}", style("Nothing to prune").green());
        return Ok(0);
    }

    let verb = if dry_run { "would delete" } else { "deleted" };
    for artifact in &report.selected {
        if dry_run || report.deleted.contains(&artifact.name) {
            println!("  {} {}", verb, artifact.name);
        }
    }
    for failure in &report.failures {
        println!("  {} could not delete {}: {}", style("!").yellow(), failure.name, failure.error);
    }

    Ok(if report.failures.is_empty() { 0 } else { 4 })
}

fn summary(config: &AppConfig) -> Vec<String> {
    let db = &config.database;
    vec![
        format!("Database: {}@{}:{}/{}", db.username, db.host, db.port, db.name),
        match config.dump.compression {
            Compression::Gzip => format!("Format:   {}, gzip", db.format),
            Compression::None => format!("Format:   {}", db.format),
        },
        format!("Storage:  {}", config.storage),
        format!("Schedule: {}", config.schedule.interval),
    ]
}

pub async fn check(path: Option<&Path>) -> Result<i32> {
    let config = config::load(path)?;
    println!("{} Configuration is valid", style("✓").green());
    for line in summary(&config) {
        println!("  {}", line);
    }

    let pg_dump = database::locate_pg_dump(&config.dump)?;
    println!("{} pg_dump: {}", style("✓").green(), pg_dump.display());

    let store = storage::create_store(&config.storage).await?;
    let artifacts = store.list().await?;
    println!(
        "{} Store {} is reachable ({} artifact(s))",
        style("✓").green(),
        style(store.location()).cyan(),
        artifacts.len()
    );
    Ok(0)
}

pub fn init(path: Option<&Path>, force: bool) -> Result<i32> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config::config_path);
    if path.exists() && !force {
        return Err(BackupError::Config(format!(
            "{} already exists, use --force to overwrite",
            path.display()
        )));
    }

    config::save_to(&AppConfig::default(), &path)?;
    println!("{} Wrote default configuration to {}", style("✓").green(), path.display());
    Ok(0)
}
