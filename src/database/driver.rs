use crate::config::DatabaseConfig;
use crate::error::DumpError;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Dump output as it is produced. The stream only ends cleanly once the tool
/// has exited successfully; any failure arrives as a final `Err` item.
pub type DumpStream = BoxStream<'static, std::result::Result<Vec<u8>, DumpError>>;

#[async_trait]
pub trait DumpSource: Send + Sync {
    /// Starts a dump of `target`. The returned stream enforces `timeout` and
    /// stops when `shutdown` fires.
    async fn run(
        &self,
        target: &DatabaseConfig,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> std::result::Result<DumpStream, DumpError>;

    fn tool_name(&self) -> &'static str;
}
