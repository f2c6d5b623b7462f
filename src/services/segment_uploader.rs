//! Per-segment upload state machine.
//!
//! One attempt walks `Unhashed -> Hashed -> Checked -> Uploaded`. Any error
//! moves it to `Failed`: the attempt is logged, a fixed backoff elapses and
//! the scheduler gets the segment back to queue it again. A digest computed
//! by an earlier attempt is kept, so retries skip straight to the check.

use crate::errors::{TransportError, UploadError, UploadResult};
use crate::models::segment::{Segment, segment_object_path};
use crate::services::auth::StorageEndpoint;
use crate::services::source::ByteSource;
use crate::services::transport::{Method, ProgressFn, Transport};
use futures::StreamExt;
use md5::Context;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

pub const ETAG_HEADER: &str = "Etag";
pub const DELETE_AT_HEADER: &str = "X-Delete-At";
pub const REMOVE_DELETE_AT_HEADER: &str = "X-Remove-Delete-At";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentState {
    Unhashed,
    Hashed,
    Checked,
    Uploaded,
    Failed,
}

/// What the existence check found at the segment's remote path.
#[derive(Debug, PartialEq, Eq)]
enum RemoteCopy {
    Absent,
    Matches,
}

/// How to bring a reused remote object's expiry in line with the job.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ExpiryAction {
    Keep,
    Extend(i64),
    Remove,
}

/// The object must live at least as long as the job asks for. No expiry on
/// the job means the object must not expire at all.
pub(crate) fn reconcile_expiry(requested: Option<i64>, existing: Option<i64>) -> ExpiryAction {
    match (requested, existing) {
        (Some(requested), Some(existing)) if existing >= requested => ExpiryAction::Keep,
        (Some(requested), _) => ExpiryAction::Extend(requested),
        (None, Some(_)) => ExpiryAction::Remove,
        (None, None) => ExpiryAction::Keep,
    }
}

/// Result of one attempt, handed back to the scheduler.
#[derive(Debug)]
pub struct AttemptOutcome {
    pub request_id: u64,
    pub segment: Segment,
    pub result: UploadResult<SegmentState>,
}

impl AttemptOutcome {
    pub fn state(&self) -> SegmentState {
        match &self.result {
            Ok(state) => *state,
            Err(_) => SegmentState::Failed,
        }
    }
}

/// Uploads individual segments of one job.
pub struct SegmentUploader<'a, T, S> {
    transport: &'a T,
    source: &'a S,
    endpoint: &'a StorageEndpoint,
    container: String,
    delete_at: Option<i64>,
    timeout: Duration,
    backoff: Duration,
}

impl<'a, T: Transport, S: ByteSource> SegmentUploader<'a, T, S> {
    pub fn new(
        transport: &'a T,
        source: &'a S,
        endpoint: &'a StorageEndpoint,
        container: impl Into<String>,
        delete_at: Option<i64>,
        timeout: Duration,
        backoff: Duration,
    ) -> Self {
        Self {
            transport,
            source,
            endpoint,
            container: container.into(),
            delete_at,
            timeout,
            backoff,
        }
    }

    /// Run one attempt and, on failure, wait out the backoff before
    /// reporting back.
    pub async fn run(
        &self,
        request_id: u64,
        mut segment: Segment,
        progress: ProgressFn,
    ) -> AttemptOutcome {
        let result = self.attempt(&mut segment, &progress).await;
        if let Err(err) = &result {
            warn!(
                "segment {} (request {}) failed: {}; retrying in {:?}",
                segment.index, request_id, err, self.backoff
            );
            tokio::time::sleep(self.backoff).await;
        }
        AttemptOutcome {
            request_id,
            segment,
            result,
        }
    }

    /// Drive `segment` through the state machine once.
    ///
    /// Returns the terminal state reached; `segment` reflects everything
    /// learned along the way even when an error is returned.
    pub async fn attempt(
        &self,
        segment: &mut Segment,
        progress: &ProgressFn,
    ) -> UploadResult<SegmentState> {
        let mut state = SegmentState::Unhashed;

        let digest = match &segment.digest {
            Some(digest) => digest.clone(),
            None => {
                let digest = self.hash(segment).await?;
                debug!("segment {} digest {}", segment.index, digest);
                segment.digest = Some(digest.clone());
                digest
            }
        };
        state = advance(state, SegmentState::Hashed);

        let path = segment
            .remote_path
            .get_or_insert_with(|| segment_object_path(&digest))
            .clone();

        match self.check(&path, &digest).await? {
            RemoteCopy::Matches => {
                debug!("segment {} already stored at {}", segment.index, path);
                segment.mark_done();
                progress(segment.bytes_sent);
                return Ok(advance(state, SegmentState::Checked));
            }
            RemoteCopy::Absent => {
                segment.reset_progress();
                progress(0);
            }
        }
        state = advance(state, SegmentState::Checked);

        let sent = Arc::new(AtomicU64::new(0));
        let upload_result = self
            .upload(segment, &path, &digest, tracking(progress, sent.clone()))
            .await;
        if let Err(err) = upload_result {
            segment.bytes_sent = sent.load(Ordering::Relaxed).min(segment.size);
            return Err(err);
        }
        segment.mark_done();
        progress(segment.bytes_sent);
        debug!("segment {} uploaded to {}", segment.index, path);
        Ok(advance(state, SegmentState::Uploaded))
    }

    /// Stream the segment's range through MD5.
    async fn hash(&self, segment: &Segment) -> UploadResult<String> {
        let read_error = |source| UploadError::Hash {
            index: segment.index,
            source,
        };
        let mut stream = self
            .source
            .read_range(segment.start, segment.end)
            .await
            .map_err(read_error)?;
        let mut digest = Context::new();
        let mut read = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(read_error)?;
            read += chunk.len() as u64;
            digest.consume(&chunk);
        }
        if read != segment.size {
            return Err(read_error(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read {} of {} bytes", read, segment.size),
            )));
        }
        Ok(format!("{:x}", digest.compute()))
    }

    /// HEAD the remote path and, for a matching copy, reconcile its expiry.
    async fn check(&self, path: &str, digest: &str) -> UploadResult<RemoteCopy> {
        let request = self
            .endpoint
            .request(Method::Head, &self.container, path, self.timeout)?;
        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(err) if err.is_absent() => {
                if matches!(err, TransportError::ServiceUnavailable) {
                    warn!(
                        "HEAD {}/{} returned 503, treating segment as absent",
                        self.container, path
                    );
                }
                return Ok(RemoteCopy::Absent);
            }
            Err(err) => return Err(err.into()),
        };

        let matches = response
            .header("etag")
            .map(|etag| etag.trim_matches('"').eq_ignore_ascii_case(digest))
            .unwrap_or(false);
        if !matches {
            return Ok(RemoteCopy::Absent);
        }

        let existing = response
            .header("x-delete-at")
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|at| *at > 0);
        let update = match reconcile_expiry(self.delete_at, existing) {
            ExpiryAction::Keep => None,
            ExpiryAction::Extend(at) => {
                debug!("extending expiry of {} to {}", path, at);
                Some((DELETE_AT_HEADER, at.to_string()))
            }
            ExpiryAction::Remove => {
                debug!("removing expiry of {}", path);
                Some((REMOVE_DELETE_AT_HEADER, "1".to_string()))
            }
        };
        if let Some((header, value)) = update {
            let request = self
                .endpoint
                .request(Method::Post, &self.container, path, self.timeout)?
                .header(header, value);
            self.transport.send(request).await?;
        }
        Ok(RemoteCopy::Matches)
    }

    async fn upload(
        &self,
        segment: &Segment,
        path: &str,
        digest: &str,
        progress: ProgressFn,
    ) -> UploadResult<()> {
        let stream = self
            .source
            .read_range(segment.start, segment.end)
            .await
            .map_err(|source| UploadError::Hash {
                index: segment.index,
                source,
            })?;
        let mut request = self
            .endpoint
            .request(Method::Put, &self.container, path, self.timeout)?
            .header(ETAG_HEADER, digest)
            .stream(stream, segment.size)
            .with_progress(progress);
        if let Some(at) = self.delete_at {
            request = request.header(DELETE_AT_HEADER, at.to_string());
        }
        self.transport.send(request).await?;
        Ok(())
    }
}

fn advance(from: SegmentState, to: SegmentState) -> SegmentState {
    debug_assert!(
        matches!(
            (from, to),
            (SegmentState::Unhashed, SegmentState::Hashed)
                | (SegmentState::Hashed, SegmentState::Checked)
                | (SegmentState::Checked, SegmentState::Uploaded)
        ),
        "invalid transition {:?} -> {:?}",
        from,
        to
    );
    to
}

/// Forward transport progress while remembering the last value seen.
fn tracking(progress: &ProgressFn, sent: Arc<AtomicU64>) -> ProgressFn {
    let progress = progress.clone();
    Arc::new(move |loaded| {
        sent.store(loaded, Ordering::Relaxed);
        progress(loaded);
    })
}
