//! Caller-facing entry point: authenticate, plan, upload segments, publish
//! the manifest.

use crate::errors::{UploadError, UploadFailure};
use crate::models::job::{ProgressUpdate, UploadJob, UploadOptions};
use crate::services::auth::{Authenticator, Credentials, KeystoneAuthenticator};
use crate::services::manifest_builder::ManifestBuilder;
use crate::services::planner::plan_segments;
use crate::services::scheduler::ChunkScheduler;
use crate::services::segment_uploader::SegmentUploader;
use crate::services::source::ByteSource;
use crate::services::transport::Transport;
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span};

/// Uploads files into a Swift object store.
///
/// Cheap to share: holds the authenticator and a shared transport. A job
/// cannot be cancelled once started other than by dropping its future.
pub struct SwiftUploader<A, T> {
    authenticator: A,
    transport: Arc<T>,
}

impl<T: Transport> SwiftUploader<KeystoneAuthenticator<T>, T> {
    /// Uploader that authenticates against Keystone over the same transport.
    pub fn keystone(transport: Arc<T>) -> Self {
        Self {
            authenticator: KeystoneAuthenticator::new(transport.clone()),
            transport,
        }
    }
}

impl<A: Authenticator, T: Transport> SwiftUploader<A, T> {
    pub fn new(authenticator: A, transport: Arc<T>) -> Self {
        Self {
            authenticator,
            transport,
        }
    }

    /// Upload `file` to `container/object_path`.
    ///
    /// Returns the number of bytes stored. Segment failures are retried
    /// internally and only show up through `on_progress`; the error carries
    /// the bytes that were stored before a fatal failure.
    pub async fn upload_file<S, P>(
        &self,
        credentials: &Credentials,
        file: &S,
        container: &str,
        object_path: &str,
        options: UploadOptions,
        mut on_progress: P,
    ) -> Result<u64, UploadFailure>
    where
        S: ByteSource,
        P: FnMut(ProgressUpdate) + Send,
    {
        options
            .validate()
            .map_err(|err| UploadFailure::new(err, 0))?;

        let file_size = file.size();
        let segments = plan_segments(file_size, options.segment_size, object_path);
        let mut job = UploadJob::new(container, object_path, file_size, segments, &options);
        let span = info_span!("upload", job_id = %job.id, container, object = object_path);

        async {
            info!(
                "uploading {} bytes to {}/{} in {} segments",
                file_size,
                container,
                object_path,
                job.segments.len()
            );
            let result = self
                .run_job(credentials, file, &mut job, &options, &mut on_progress)
                .await;
            match result {
                Ok(bytes) => {
                    info!("upload complete, {} bytes", bytes);
                    Ok(bytes)
                }
                Err(err) => {
                    error!("upload failed: {}", err);
                    Err(UploadFailure::new(err, job.completed_bytes()))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_job<S, P>(
        &self,
        credentials: &Credentials,
        file: &S,
        job: &mut UploadJob,
        options: &UploadOptions,
        on_progress: &mut P,
    ) -> Result<u64, UploadError>
    where
        S: ByteSource,
        P: FnMut(ProgressUpdate),
    {
        let session = self.authenticator.authenticate(credentials).await?;
        let endpoint = session.storage_endpoint(&options.service_name)?;

        let uploader = SegmentUploader::new(
            self.transport.as_ref(),
            file,
            &endpoint,
            job.container.clone(),
            job.delete_at,
            options.segment_timeout,
            options.segment_backoff,
        );
        let bytes = ChunkScheduler::new(job, options.max_segment_attempts)
            .run(&uploader, on_progress)
            .await?;

        if job.needs_manifest() {
            ManifestBuilder::new(
                self.transport.as_ref(),
                &endpoint,
                options.manifest_retry.clone(),
                options.manifest_timeout,
            )
            .publish(job)
            .await?;
        }
        Ok(bytes)
    }
}
