use crate::config::{Compression, DumpFormat};
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// One completed, immutable backup as seen by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub name: String,

    pub size: u64,

    pub created_at: DateTime<Utc>,

    /// Backend-specific location, e.g. a file path or `s3://bucket/key`.
    pub location: String,

    /// Hex SHA-256 of the stored bytes, known only right after a write.
    pub checksum: Option<String>,
}

/// Builds the artifact file name for a dump taken at `timestamp`.
pub fn artifact_name(
    template: &str,
    database: &str,
    timestamp: DateTime<Utc>,
    format: DumpFormat,
    compression: Compression,
) -> String {
    let stem = template
        .replace("{database}", database)
        .replace("{timestamp}", &timestamp.format(TIMESTAMP_FORMAT).to_string());

    match compression {
        Compression::Gzip => format!("{}.{}.gz", stem, format.extension()),
        Compression::None => format!("{}.{}", stem, format.extension()),
    }
}

/// Whether a stored object name looks like something this agent produced.
pub fn is_artifact_name(name: &str) -> bool {
    if name.starts_with('.') || name.ends_with(".partial") {
        return false;
    }
    let base = name.strip_suffix(".gz").unwrap_or(name);
    [DumpFormat::Custom, DumpFormat::Plain, DumpFormat::Tar]
        .iter()
        .any(|f| base.ends_with(&format!(".{}", f.extension())))
}

/// Source of "now" for artifact names and age-based retention.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[cfg(test)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: std::sync::Mutex::new(start) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
