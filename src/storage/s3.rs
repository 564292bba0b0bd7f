use super::store::{check_name, spool, ArtifactStore};
use crate::backup::{is_artifact_name, Artifact};
use crate::database::DumpStream;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_smithy_types::byte_stream::Length;
use s3::operation::list_objects_v2::ListObjectsV2Output;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart, Object, StorageClass};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const QUOTA_CODES: &[&str] = &["QuotaExceeded", "EntityTooLarge", "InsufficientStorage"];

/// Spooled dumps above this size are uploaded in parts.
const MULTIPART_THRESHOLD: u64 = 50 * 1024 * 1024;
const PART_SIZE: u64 = 16 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;

/// Stores artifacts as objects under a bucket prefix.
///
/// The dump is spooled to a local temporary file first. Small dumps go up with
/// a single `PutObject`, larger ones as a multipart upload; either way the
/// object only becomes visible once complete.
pub struct S3Store {
    client: s3::Client,
    bucket: String,
    prefix: String,
    spool_dir: PathBuf,
}

impl S3Store {
    pub async fn connect(
        bucket: String,
        region: String,
        prefix: String,
        endpoint_url: Option<String>,
        spool_dir: PathBuf,
    ) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(region));
        if let Some(endpoint) = &endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        Self {
            client: s3::Client::new(&sdk_config),
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
            spool_dir,
        }
    }

    fn key(&self, name: &str) -> String {
        object_key(&self.prefix, name)
    }

    fn list_prefix(&self) -> Option<String> {
        if self.prefix.is_empty() {
            None
        } else {
            Some(format!("{}/", self.prefix))
        }
    }

    async fn put(&self, key: &str, path: &Path) -> std::result::Result<(), StoreError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("read spool file: {}", e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(StorageClass::Standard)
            .body(body)
            .send()
            .await
            .map_err(|e| classify("put object", e))?;
        Ok(())
    }

    /// Uploads `path` in parts; the upload is aborted if any step fails.
    async fn put_multipart(
        &self,
        key: &str,
        path: &Path,
        size: u64,
    ) -> std::result::Result<(), StoreError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(StorageClass::Standard)
            .send()
            .await
            .map_err(|e| classify("create multipart upload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::Unavailable("create multipart upload: no upload id".into()))?
            .to_string();

        let result = self.send_parts(key, &upload_id, path, size).await;
        if result.is_err() {
            let aborted = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await;
            if let Err(e) = aborted {
                warn!(
                    "Failed to abort multipart upload {}: {}",
                    upload_id,
                    DisplayErrorContext(&e)
                );
            }
        }
        result
    }

    async fn send_parts(
        &self,
        key: &str,
        upload_id: &str,
        path: &Path,
        size: u64,
    ) -> std::result::Result<(), StoreError> {
        let ranges = part_ranges(size, part_size_for(size));
        let total = ranges.len();
        let mut completed = Vec::with_capacity(total);

        for (index, (offset, length)) in ranges.into_iter().enumerate() {
            let part_number = index as i32 + 1;
            let body = ByteStream::read_from()
                .path(path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| StoreError::Unavailable(format!("read spool file: {}", e)))?;

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| classify("upload part", e))?;
            debug!("Uploaded part {}/{} ({} bytes)", part_number, total, length);

            completed.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify("complete multipart upload", e))?;
        Ok(())
    }
}

pub fn object_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Maps an S3 service error code / HTTP status onto the store taxonomy.
pub fn classify_service_error(code: Option<&str>, status: u16, message: String) -> StoreError {
    match code {
        Some(code) if QUOTA_CODES.contains(&code) => StoreError::QuotaExceeded(message),
        _ if status >= 500 || status == 429 => StoreError::Unavailable(message),
        Some("SlowDown") | Some("RequestTimeout") => StoreError::Unavailable(message),
        _ => StoreError::Rejected(message),
    }
}

fn classify<E>(context: &str, err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{}: {}", context, DisplayErrorContext(&err));
    match &err {
        SdkError::ServiceError(service) => {
            classify_service_error(service.err().code(), service.raw().status().as_u16(), message)
        }
        _ => StoreError::Unavailable(message),
    }
}

fn to_chrono(value: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

/// Part size for an upload of `size` bytes, grown so it fits in `MAX_PARTS`.
fn part_size_for(size: u64) -> u64 {
    PART_SIZE.max(size.div_ceil(MAX_PARTS))
}

/// `(offset, length)` of each part; only the last one may be short.
fn part_ranges(size: u64, part_size: u64) -> Vec<(u64, u64)> {
    (0..size)
        .step_by(part_size as usize)
        .map(|offset| (offset, part_size.min(size - offset)))
        .collect()
}

/// The artifact a listed object stands for, if it is one.
///
/// Keys are stripped of `prefix`; nested keys, foreign names and objects
/// without a modification time are skipped.
fn artifact_from_object(bucket: &str, prefix: Option<&str>, object: &Object) -> Option<Artifact> {
    let key = object.key()?;
    let name = match prefix {
        Some(p) => key.strip_prefix(p)?,
        None => key,
    };
    if name.contains('/') || !is_artifact_name(name) {
        return None;
    }
    let created_at = object.last_modified().and_then(to_chrono)?;

    Some(Artifact {
        name: name.to_string(),
        size: object.size().unwrap_or(0).max(0) as u64,
        created_at,
        location: format!("s3://{}/{}", bucket, key),
        checksum: None,
    })
}

fn next_page(page: &ListObjectsV2Output) -> Option<String> {
    match page.next_continuation_token() {
        Some(token) if page.is_truncated() == Some(true) => Some(token.to_string()),
        _ => None,
    }
}

/// Drains a paginated listing, feeding each continuation token back to
/// `fetch`, and returns the artifacts oldest first.
async fn collect_listing<F, Fut>(
    bucket: &str,
    prefix: Option<&str>,
    mut fetch: F,
) -> std::result::Result<Vec<Artifact>, StoreError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = std::result::Result<ListObjectsV2Output, StoreError>>,
{
    let mut artifacts = Vec::new();
    let mut token = None;

    loop {
        let page = fetch(token.take()).await?;
        artifacts.extend(
            page.contents()
                .iter()
                .filter_map(|object| artifact_from_object(bucket, prefix, object)),
        );
        match next_page(&page) {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
    Ok(artifacts)
}

#[async_trait]
impl ArtifactStore for S3Store {
    async fn write(&self, name: &str, stream: DumpStream) -> Result<Artifact> {
        check_name(name)?;
        tokio::fs::create_dir_all(&self.spool_dir)
            .await
            .map_err(|e| StoreError::from_io("create spool directory", e))?;

        // removed on drop, whatever happens below
        let spool_file = tempfile::Builder::new()
            .prefix(".pg-backup-")
            .suffix(".partial")
            .tempfile_in(&self.spool_dir)
            .map_err(|e| StoreError::from_io("create spool file", e))?;
        let handle = spool_file
            .reopen()
            .map_err(|e| StoreError::from_io("open spool file", e))?;
        let mut file = tokio::fs::File::from_std(handle);

        let spooled = spool(stream, &mut file).await?;
        drop(file);
        debug!("Spooled {} bytes to {}", spooled.size, spool_file.path().display());

        let key = self.key(name);
        info!("Uploading to s3://{}/{}", self.bucket, key);

        if spooled.size > MULTIPART_THRESHOLD {
            self.put_multipart(&key, spool_file.path(), spooled.size).await?;
        } else {
            self.put(&key, spool_file.path()).await?;
        }

        info!("Upload complete: s3://{}/{}", self.bucket, key);
        Ok(Artifact {
            name: name.to_string(),
            size: spooled.size,
            created_at: Utc::now(),
            location: format!("s3://{}/{}", self.bucket, key),
            checksum: Some(spooled.checksum),
        })
    }

    async fn list(&self) -> Result<Vec<Artifact>> {
        let prefix = self.list_prefix();
        let artifacts = collect_listing(&self.bucket, prefix.as_deref(), |token| {
            let request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(prefix.clone())
                .set_continuation_token(token);
            async move { request.send().await.map_err(|e| classify("list objects", e)) }
        })
        .await?;
        Ok(artifacts)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        check_name(name)?;
        let key = self.key(name);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| classify("delete object", e))?;
        info!("Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "s3"
    }

    fn location(&self) -> String {
        match self.list_prefix() {
            Some(prefix) => format!("s3://{}/{}", self.bucket, prefix),
            None => format!("s3://{}", self.bucket),
        }
    }
}
