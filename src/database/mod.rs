mod driver;
mod pg_dump;

pub use driver::{DumpSource, DumpStream};
pub use pg_dump::PgDumpExecutor;

use crate::config::DumpConfig;
use crate::error::{BackupError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Resolves the `pg_dump` binary: the configured path, or the first one on `PATH`.
pub fn locate_pg_dump(config: &DumpConfig) -> Result<PathBuf> {
    if let Some(path) = &config.pg_dump_path {
        if !path.exists() {
            return Err(BackupError::Config(format!(
                "configured pg_dump_path does not exist: {}",
                path.display()
            )));
        }
        return Ok(path.clone());
    }

    let found = which::which("pg_dump").map_err(|_| {
        BackupError::Config(
            "pg_dump not found on PATH. Install the PostgreSQL client tools (e.g. apt install postgresql-client)"
                .to_string(),
        )
    })?;
    info!("pg_dump found on PATH: {}", found.display());
    Ok(found)
}

pub fn create_source(config: &DumpConfig) -> Result<Arc<dyn DumpSource>> {
    let program = locate_pg_dump(config)?;
    Ok(Arc::new(PgDumpExecutor::new(program)))
}
