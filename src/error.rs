use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failures produced while running the dump tool.
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("could not connect to database: {0}")]
    Connection(String),

    #[error("pg_dump exited with {}: {stderr}", exit_label(.code))]
    Tool { code: Option<i32>, stderr: String },

    #[error("pg_dump did not finish within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("pg_dump produced no output")]
    EmptyOutput,

    #[error("failed to start pg_dump: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to read pg_dump output: {0}")]
    Stream(#[source] io::Error),

    #[error("dump cancelled")]
    Cancelled,
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "signal".to_string(),
    }
}

impl DumpError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DumpError::Connection(_)
                | DumpError::Tool { .. }
                | DumpError::Timeout(_)
                | DumpError::EmptyOutput
                | DumpError::Stream(_)
        )
    }
}

/// Failures reported by an artifact store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("storage rejected request: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// Maps a local I/O failure onto the store taxonomy.
    pub fn from_io(context: &str, err: io::Error) -> Self {
        use io::ErrorKind;

        let message = format!("{}: {}", context, err);
        match err.kind() {
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded | ErrorKind::FileTooLarge => {
                StoreError::QuotaExceeded(message)
            }
            ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => {
                StoreError::Rejected(message)
            }
            _ => StoreError::Unavailable(message),
        }
    }
}

/// Which step of a cycle a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Config,
    Dump,
    Store,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dump error: {0}")]
    Dump(#[from] DumpError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackupError {
    pub fn is_retryable(&self) -> bool {
        match self {
            BackupError::Dump(e) => e.is_retryable(),
            BackupError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BackupError::Dump(DumpError::Cancelled) => FailureKind::Cancelled,
            BackupError::Dump(DumpError::Spawn(_)) => FailureKind::Config,
            BackupError::Dump(_) => FailureKind::Dump,
            BackupError::Store(_) | BackupError::Io(_) => FailureKind::Store,
            BackupError::Config(_) | BackupError::Serialization(_) => FailureKind::Config,
            BackupError::Notify(_) => FailureKind::Store,
        }
    }
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for BackupError {
    fn from(err: toml::ser::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(err: reqwest::Error) -> Self {
        BackupError::Notify(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
