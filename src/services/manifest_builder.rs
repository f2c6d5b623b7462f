//! Publishes the static-large-object manifest once every segment is stored.

use crate::errors::{UploadError, UploadResult};
use crate::models::job::UploadJob;
use crate::models::manifest::ManifestEntry;
use crate::services::auth::StorageEndpoint;
use crate::services::retry::{RetryPolicy, retry_with_backoff};
use crate::services::segment_uploader::DELETE_AT_HEADER;
use crate::services::transport::{Method, Transport};
use std::time::Duration;
use tracing::{error, info};

/// Query parameter telling Swift the body is a manifest.
pub const MANIFEST_QUERY: (&str, &str) = ("multipart-manifest", "put");

pub struct ManifestBuilder<'a, T> {
    transport: &'a T,
    endpoint: &'a StorageEndpoint,
    retry: RetryPolicy,
    timeout: Duration,
}

impl<'a, T: Transport> ManifestBuilder<'a, T> {
    pub fn new(
        transport: &'a T,
        endpoint: &'a StorageEndpoint,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            endpoint,
            retry,
            timeout,
        }
    }

    /// Manifest lines in segment order.
    ///
    /// Every segment must be done and carry its digest and remote path;
    /// anything else means the scheduler has not finished.
    pub fn entries(job: &UploadJob) -> UploadResult<Vec<ManifestEntry>> {
        let mut segments: Vec<_> = job.segments.iter().collect();
        segments.sort_by_key(|segment| segment.index);
        segments
            .into_iter()
            .map(|segment| match (segment.done, &segment.digest, &segment.remote_path) {
                (true, Some(digest), Some(path)) => Ok(ManifestEntry {
                    path: format!("{}/{}", job.container, path),
                    digest: digest.clone(),
                    size_bytes: segment.size,
                }),
                _ => Err(UploadError::ManifestNotReady(format!(
                    "segment {} is not uploaded",
                    segment.index
                ))),
            })
            .collect()
    }

    /// Create `<container>/<object_path>` as a manifest over the job's
    /// segments, retrying with backoff.
    pub async fn publish(&self, job: &UploadJob) -> UploadResult<()> {
        if !job.completion.has_fired() {
            return Err(UploadError::ManifestNotReady(
                "segments are still being uploaded".into(),
            ));
        }
        let entries = Self::entries(job)?;
        let body = serde_json::to_value(&entries)?;

        let what = format!("manifest {}/{}", job.container, job.object_path);
        let result = retry_with_backoff(&self.retry, &what, |_| {
            let body = body.clone();
            async move {
                let mut request = self
                    .endpoint
                    .request(Method::Put, &job.container, &job.object_path, self.timeout)?
                    .query(MANIFEST_QUERY.0, MANIFEST_QUERY.1)
                    .json(body);
                if let Some(at) = job.delete_at {
                    request = request.header(DELETE_AT_HEADER, at.to_string());
                }
                self.transport.send(request).await?;
                Ok::<(), UploadError>(())
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!("{} created with {} segments", what, entries.len());
                Ok(())
            }
            Err((attempts, err)) => {
                error!("{} failed after {} attempts: {}", what, attempts, err);
                Err(UploadError::Manifest {
                    attempts,
                    source: Box::new(err),
                })
            }
        }
    }
}
