use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DumpFormat {
    #[default]
    Custom,
    Plain,
    Tar,
}

impl DumpFormat {
    /// The single-letter value passed to `pg_dump -F`.
    pub fn flag(&self) -> &'static str {
        match self {
            DumpFormat::Custom => "c",
            DumpFormat::Plain => "p",
            DumpFormat::Tar => "t",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DumpFormat::Custom => "dump",
            DumpFormat::Plain => "sql",
            DumpFormat::Tar => "tar",
        }
    }
}

impl std::fmt::Display for DumpFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DumpFormat::Custom => write!(f, "custom"),
            DumpFormat::Plain => write!(f, "plain"),
            DumpFormat::Tar => write!(f, "tar"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub name: String,
    #[serde(default)]
    pub include_tables: Vec<String>,
    #[serde(default)]
    pub exclude_tables: Vec<String>,
    #[serde(default)]
    pub format: DumpFormat,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: String::new(),
            name: "postgres".to_string(),
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            format: DumpFormat::Custom,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Schedule {
    Seconds(u32),
    Minutes(u32),
    Hours(u32),
    Days(u32),
}

impl Schedule {
    pub fn as_seconds(&self) -> u64 {
        match self {
            Schedule::Seconds(n) => *n as u64,
            Schedule::Minutes(n) => *n as u64 * 60,
            Schedule::Hours(n) => *n as u64 * 3600,
            Schedule::Days(n) => *n as u64 * 86400,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.as_seconds())
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Seconds(n) => write!(f, "Every {} second(s)", n),
            Schedule::Minutes(n) => write!(f, "Every {} minute(s)", n),
            Schedule::Hours(n) => write!(f, "Every {} hour(s)", n),
            Schedule::Days(n) => write!(f, "Every {} day(s)", n),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    #[serde(default)]
    pub pg_dump_path: Option<PathBuf>,
    #[serde(default = "default_dump_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default = "default_name_template")]
    pub name_template: String,
}

fn default_dump_timeout() -> u64 {
    3600
}

fn default_name_template() -> String {
    "{database}_{timestamp}".to_string()
}

impl DumpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            pg_dump_path: None,
            timeout_secs: default_dump_timeout(),
            compression: Compression::Gzip,
            name_template: default_name_template(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    Local {
        directory: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default = "default_region")]
        region: String,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        endpoint_url: Option<String>,
        #[serde(default = "default_spool_dir")]
        spool_dir: PathBuf,
    },
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_spool_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local {
            directory: PathBuf::from("backups"),
        }
    }
}

impl std::fmt::Display for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageConfig::Local { directory } => write!(f, "local:{}", directory.display()),
            StorageConfig::S3 { bucket, prefix, .. } if prefix.is_empty() => {
                write!(f, "s3://{}", bucket)
            }
            StorageConfig::S3 { bucket, prefix, .. } => write!(f, "s3://{}/{}", bucket, prefix),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub keep_count: Option<usize>,
    #[serde(default)]
    pub max_age: Option<Schedule>,
    #[serde(default = "default_true")]
    pub keep_latest: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_count: Some(7),
            max_age: None,
            keep_latest: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_cap() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    #[default]
    Queue,
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub interval: Schedule,
    #[serde(default = "default_true")]
    pub run_on_start: bool,
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Schedule::Days(1),
            run_on_start: true,
            overlap: OverlapPolicy::Queue,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WebhookFormat {
    #[default]
    Json,
    Discord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub format: WebhookFormat,
    #[serde(default = "default_true")]
    pub notify_on_success: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl AppConfig {
    /// Job identifier used in logs, events and the run lock.
    pub fn job_name(&self) -> &str {
        self.job_name.as_deref().unwrap_or(&self.database.name)
    }
}
