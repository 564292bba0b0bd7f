mod types;

pub use types::*;

use crate::error::{BackupError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".pg_backup_agent"))
        .unwrap_or_else(|| PathBuf::from(".pg_backup_agent"))
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Loads the file (defaults when absent), applies environment overrides and validates.
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    let mut config = load_from(&path)?;
    apply_env(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

pub fn load_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        debug!("Config file not found at {:?}, using defaults", path);
        return Ok(AppConfig::default());
    }

    info!("Loading configuration from {:?}", path);
    let contents = fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&contents)?;
    Ok(config)
}

pub fn save_to(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            info!("Creating config directory: {:?}", parent);
            fs::create_dir_all(parent)?;
        }
    }

    let contents = toml::to_string_pretty(config)?;
    fs::write(path, contents)?;
    info!("Configuration saved to {:?}", path);
    Ok(())
}

fn split_tables(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Applies the `PG_*` / `S3_*` environment variables on top of the file config.
///
/// `lookup` is injected so tests don't have to mutate the process environment.
pub fn apply_env<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(host) = get("PG_HOST") {
        config.database.host = host;
    }
    if let Some(port) = get("PG_PORT") {
        config.database.port = port
            .parse()
            .map_err(|_| BackupError::Config(format!("PG_PORT is not a valid port: {}", port)))?;
    }
    if let Some(name) = get("PG_DB") {
        config.database.name = name;
    }
    if let Some(user) = get("PG_USER") {
        config.database.username = user;
    }
    if let Some(password) = get("PG_PASSWORD") {
        config.database.password = password;
    }
    if let Some(tables) = get("INCLUDE_TABLES") {
        config.database.include_tables = split_tables(&tables);
    }
    if let Some(tables) = get("EXCLUDE_TABLES") {
        config.database.exclude_tables = split_tables(&tables);
    }

    if let Some(bucket) = get("S3_BUCKET") {
        let (region, prefix, endpoint_url, spool_dir) = match &config.storage {
            StorageConfig::S3 { region, prefix, endpoint_url, spool_dir, .. } => {
                (region.clone(), prefix.clone(), endpoint_url.clone(), spool_dir.clone())
            }
            StorageConfig::Local { .. } => {
                ("us-east-1".to_string(), String::new(), None, std::env::temp_dir())
            }
        };
        config.storage = StorageConfig::S3 { bucket, region, prefix, endpoint_url, spool_dir };
    }
    if let StorageConfig::S3 { region, prefix, endpoint_url, spool_dir, .. } = &mut config.storage {
        if let Some(value) = get("S3_REGION") {
            *region = value;
        }
        if let Some(value) = get("S3_PREFIX") {
            *prefix = value.trim_matches('/').to_string();
        }
        if let Some(value) = get("S3_ENDPOINT") {
            *endpoint_url = Some(value);
        }
        if let Some(value) = get("DUMP_PATH") {
            *spool_dir = PathBuf::from(value);
        }
    }

    Ok(())
}

/// Upper bound for `retention.max_age`, roughly a century.
const MAX_RETENTION_SECS: u64 = 36_500 * 86_400;

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(BackupError::Config(msg.to_string()));
        let db = &self.database;

        if db.host.trim().is_empty() {
            return fail("database host is required (PG_HOST)");
        }
        if db.port == 0 {
            return fail("database port must be non-zero");
        }
        if db.name.trim().is_empty() {
            return fail("database name is required (PG_DB)");
        }
        if db.username.trim().is_empty() {
            return fail("database user is required (PG_USER)");
        }
        if !db.include_tables.is_empty() && !db.exclude_tables.is_empty() {
            return fail("include_tables and exclude_tables cannot be set at the same time");
        }
        if self.dump.timeout_secs == 0 {
            return fail("dump timeout must be greater than zero");
        }
        if !self.dump.name_template.contains("{timestamp}") {
            return fail("name_template must contain {timestamp}");
        }
        if self.dump.name_template.contains('/') {
            return fail("name_template must not contain '/'");
        }
        if self.retry.backoff_cap_secs < self.retry.backoff_base_secs {
            return fail("backoff_cap_secs must be >= backoff_base_secs");
        }
        if self.retention.keep_count == Some(0) && !self.retention.keep_latest {
            return fail("keep_count = 0 without keep_latest would delete every backup");
        }
        if let Some(age) = &self.retention.max_age {
            if age.as_seconds() == 0 {
                return fail("retention max_age must be greater than zero");
            }
            if age.as_seconds() > MAX_RETENTION_SECS {
                return fail("retention max_age must not exceed 36500 days");
            }
        }
        if self.schedule.interval.as_seconds() == 0 {
            return fail("schedule interval must be greater than zero");
        }
        match &self.storage {
            StorageConfig::Local { directory } if directory.as_os_str().is_empty() => {
                return fail("local storage directory is required");
            }
            StorageConfig::S3 { bucket, .. } if bucket.trim().is_empty() => {
                return fail("S3 bucket is required (S3_BUCKET)");
            }
            _ => {}
        }
        if let Some(webhook) = &self.notify.webhook {
            if !webhook.url.starts_with("http://") && !webhook.url.starts_with("https://") {
                return fail("webhook url must be http(s)");
            }
        }
        Ok(())
    }
}
