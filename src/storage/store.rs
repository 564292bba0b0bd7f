use crate::backup::Artifact;
use crate::database::DumpStream;
use crate::error::{BackupError, Result, StoreError};
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Consumes `stream` into a new artifact called `name`.
    ///
    /// The artifact must not appear in [`list`](Self::list) unless the whole
    /// stream was written. A stream error aborts the write and is returned as
    /// `BackupError::Dump`.
    async fn write(&self, name: &str, stream: DumpStream) -> Result<Artifact>;

    /// Completed artifacts, oldest first.
    async fn list(&self) -> Result<Vec<Artifact>>;

    /// Removes an artifact; a missing name is not an error.
    async fn delete(&self, name: &str) -> Result<()>;

    fn name(&self) -> &'static str;

    fn location(&self) -> String;
}

/// What [`spool`] wrote.
pub struct Spooled {
    pub size: u64,
    pub checksum: String,
}

/// Drains a dump stream into `writer`, hashing as it goes.
pub async fn spool<W>(mut stream: DumpStream, writer: &mut W) -> Result<Spooled>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut hasher = Sha256::new();
    let mut size = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BackupError::Dump)?;
        hasher.update(&chunk);
        size += chunk.len() as u64;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| StoreError::from_io("write artifact", e))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| StoreError::from_io("flush artifact", e))?;

    Ok(Spooled {
        size,
        checksum: hex::encode(hasher.finalize()),
    })
}

pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains('/') || name.contains('\\') {
        return Err(StoreError::Rejected(format!("invalid artifact name: {:?}", name)).into());
    }
    Ok(())
}
