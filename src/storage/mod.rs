mod local;
mod s3;
mod store;

pub use local::LocalStore;
pub use s3::S3Store;
pub use store::ArtifactStore;

use crate::config::StorageConfig;
use crate::error::Result;
use std::sync::Arc;

pub async fn create_store(config: &StorageConfig) -> Result<Arc<dyn ArtifactStore>> {
    match config {
        StorageConfig::Local { directory } => Ok(Arc::new(LocalStore::new(directory.clone()))),
        StorageConfig::S3 { bucket, region, prefix, endpoint_url, spool_dir } => {
            let store = S3Store::connect(
                bucket.clone(),
                region.clone(),
                prefix.clone(),
                endpoint_url.clone(),
                spool_dir.clone(),
            )
            .await;
            Ok(Arc::new(store))
        }
    }
}
