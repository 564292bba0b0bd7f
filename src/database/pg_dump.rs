use super::driver::{DumpSource, DumpStream};
use crate::config::DatabaseConfig;
use crate::error::DumpError;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 16;
const MAX_STDERR: usize = 16 * 1024;

/// stderr fragments pg_dump/libpq print when the server cannot be reached.
const CONNECTION_MARKERS: &[&str] = &[
    "could not connect to server",
    "connection to server",
    "could not translate host name",
    "connection refused",
    "no route to host",
    "timeout expired",
    "the database system is starting up",
    "the database system is shutting down",
];

type ChunkSender = mpsc::Sender<std::result::Result<Vec<u8>, DumpError>>;

/// Runs `pg_dump` as a child process and streams its stdout.
pub struct PgDumpExecutor {
    program: PathBuf,
    prefix_args: Vec<String>,
}

impl PgDumpExecutor {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            prefix_args: Vec::new(),
        }
    }

    /// Runs `program prefix_args... <pg_dump args>` instead of pg_dump itself.
    #[cfg(test)]
    fn wrapped(program: &str, prefix_args: &[&str]) -> Self {
        Self {
            program: PathBuf::from(program),
            prefix_args: prefix_args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn dump_args(target: &DatabaseConfig) -> Vec<String> {
        let mut args = vec![
            "-h".to_string(),
            target.host.clone(),
            "-p".to_string(),
            target.port.to_string(),
            "-U".to_string(),
            target.username.clone(),
            format!("-F{}", target.format.flag()),
            "-d".to_string(),
            target.name.clone(),
        ];

        for table in &target.include_tables {
            args.push("-t".to_string());
            args.push(table.clone());
        }
        for table in &target.exclude_tables {
            args.push("-T".to_string());
            args.push(table.clone());
        }
        args
    }

    fn command(&self, target: &DatabaseConfig) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix_args)
            .args(Self::dump_args(target))
            .env("PGPASSWORD", &target.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Turns a failed exit into the matching error class.
pub fn classify_failure(code: Option<i32>, stderr: String) -> DumpError {
    let lowered = stderr.to_lowercase();
    if CONNECTION_MARKERS.iter().any(|m| lowered.contains(m)) {
        DumpError::Connection(stderr)
    } else {
        DumpError::Tool { code, stderr }
    }
}

async fn read_stderr(mut stderr: ChildStderr) -> String {
    let mut captured = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        match stderr.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_STDERR.saturating_sub(captured.len());
                captured.extend_from_slice(&buffer[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&captured).trim().to_string()
}

async fn forward<R: AsyncRead + Unpin>(reader: &mut R, tx: &ChunkSender) -> Result<u64, DumpError> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer).await.map_err(DumpError::Stream)?;
        if bytes_read == 0 {
            return Ok(total);
        }
        total += bytes_read as u64;
        if tx.send(Ok(buffer[..bytes_read].to_vec())).await.is_err() {
            // consumer went away; treat like cancellation so the child is killed
            return Err(DumpError::Cancelled);
        }
    }
}

async fn pump(
    child: &mut Child,
    mut stdout: ChildStdout,
    stderr: ChildStderr,
    tx: &ChunkSender,
) -> Result<(), DumpError> {
    let stderr_task = tokio::spawn(read_stderr(stderr));

    let total = forward(&mut stdout, tx).await?;
    let status = child.wait().await.map_err(DumpError::Stream)?;
    let stderr = stderr_task.await.unwrap_or_default();

    if !status.success() {
        return Err(classify_failure(status.code(), stderr));
    }
    if total == 0 {
        return Err(DumpError::EmptyOutput);
    }
    if !stderr.is_empty() {
        debug!("pg_dump stderr: {}", stderr);
    }
    debug!(bytes = total, "pg_dump finished");
    Ok(())
}

fn into_stream(rx: mpsc::Receiver<std::result::Result<Vec<u8>, DumpError>>) -> DumpStream {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}

#[async_trait]
impl DumpSource for PgDumpExecutor {
    async fn run(
        &self,
        target: &DatabaseConfig,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> std::result::Result<DumpStream, DumpError> {
        info!("Starting dump: {}@{}:{}", target.name, target.host, target.port);
        debug!(
            "Running command: {} {}",
            self.program.display(),
            Self::dump_args(target).join(" ")
        );

        let mut child = self.command(target).spawn().map_err(DumpError::Spawn)?;
        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                return Err(DumpError::Spawn(std::io::Error::other(
                    "pg_dump output pipes were not captured",
                )))
            }
        };

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = tokio::time::timeout(timeout, pump(&mut child, stdout, stderr, &tx)) => {
                    result.unwrap_or(Err(DumpError::Timeout(timeout)))
                }
                _ = shutdown.cancelled() => Err(DumpError::Cancelled),
            };

            if let Err(err) = outcome {
                warn!("pg_dump failed: {}", err);
                if let Err(e) = child.start_kill() {
                    debug!("pg_dump already exited: {}", e);
                }
                let _ = child.wait().await;
                let _ = tx.send(Err(err)).await;
            }
        });

        Ok(into_stream(rx))
    }

    fn tool_name(&self) -> &'static str {
        "pg_dump"
    }
}
