use super::store::{check_name, spool, ArtifactStore};
use crate::backup::{is_artifact_name, Artifact};
use crate::database::DumpStream;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

const PARTIAL_SUFFIX: &str = ".partial";

/// Stores artifacts as files in one directory.
///
/// Writes go to a hidden `.<name>.partial` file that is renamed into place
/// only after the dump stream completed and the data was synced.
pub struct LocalStore {
    directory: PathBuf,
}

impl LocalStore {
    pub fn new(directory: PathBuf) -> Self {
        Self { directory }
    }

    fn partial_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!(".{}{}", name, PARTIAL_SUFFIX))
    }

    /// Removes partial files left behind by an interrupted process.
    async fn sweep_partials(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.directory)
            .await
            .map_err(|e| StoreError::from_io("read backup directory", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::from_io("read backup directory", e))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') && file_name.ends_with(PARTIAL_SUFFIX) {
                warn!("Removing stale partial file: {}", file_name);
                if let Err(e) = fs::remove_file(entry.path()).await {
                    warn!("Failed to remove {}: {}", file_name, e);
                }
            }
        }
        Ok(())
    }

    async fn artifact_at(&self, name: &str, path: &Path) -> Result<Artifact> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| StoreError::from_io("stat artifact", e))?;
        let created_at: DateTime<Utc> = metadata
            .modified()
            .map_err(|e| StoreError::from_io("read artifact mtime", e))?
            .into();

        Ok(Artifact {
            name: name.to_string(),
            size: metadata.len(),
            created_at,
            location: path.to_string_lossy().to_string(),
            checksum: None,
        })
    }

    async fn write_partial(
        &self,
        partial: &Path,
        stream: DumpStream,
    ) -> Result<super::store::Spooled> {
        let mut file = fs::File::create(partial)
            .await
            .map_err(|e| StoreError::from_io("create partial file", e))?;
        let spooled = spool(stream, &mut file).await?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::from_io("sync partial file", e))?;
        Ok(spooled)
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn write(&self, name: &str, stream: DumpStream) -> Result<Artifact> {
        check_name(name)?;
        fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| StoreError::from_io("create backup directory", e))?;
        self.sweep_partials().await?;

        let final_path = self.directory.join(name);
        if fs::try_exists(&final_path).await.unwrap_or(false) {
            return Err(StoreError::Rejected(format!("artifact already exists: {}", name)).into());
        }

        let partial = self.partial_path(name);
        debug!("Writing {} via {}", name, partial.display());

        let spooled = match self.write_partial(&partial, stream).await {
            Ok(spooled) => spooled,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&partial).await {
                    if rm.kind() != ErrorKind::NotFound {
                        warn!("Failed to remove partial file {}: {}", partial.display(), rm);
                    }
                }
                return Err(e);
            }
        };

        fs::rename(&partial, &final_path)
            .await
            .map_err(|e| StoreError::from_io("finalize artifact", e))?;

        let mut artifact = self.artifact_at(name, &final_path).await?;
        artifact.checksum = Some(spooled.checksum);
        info!(
            "Stored {} ({:.2} MB)",
            final_path.display(),
            spooled.size as f64 / 1_048_576.0
        );
        Ok(artifact)
    }

    async fn list(&self) -> Result<Vec<Artifact>> {
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::from_io("read backup directory", e).into()),
        };

        let mut artifacts = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::from_io("read backup directory", e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_artifact_name(&name) {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::from_io("stat artifact", e))?;
            if !file_type.is_file() {
                continue;
            }
            artifacts.push(self.artifact_at(&name, &entry.path()).await?);
        }

        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(artifacts)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        check_name(name)?;
        match fs::remove_file(self.directory.join(name)).await {
            Ok(()) => {
                info!("Deleted {}", name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} already gone", name);
                Ok(())
            }
            Err(e) => Err(StoreError::from_io("delete artifact", e).into()),
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> String {
        self.directory.display().to_string()
    }
}
