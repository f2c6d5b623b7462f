//! Represents one file upload and the options that drive it.

use super::segment::Segment;
use crate::errors::{UploadError, UploadResult};
use crate::services::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Default number of segments processed at the same time.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Default maximum segment size: 100 MiB.
pub const DEFAULT_SEGMENT_SIZE: u64 = 100 * 1024 * 1024;

/// Delay before a failed segment goes back to the queue.
pub const DEFAULT_SEGMENT_BACKOFF: Duration = Duration::from_secs(60);

pub const DEFAULT_SEGMENT_TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_MANIFEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Catalog name of the object-storage service.
pub const DEFAULT_SERVICE_NAME: &str = "swift";

/// Tunables for a single upload.
#[derive(Clone, Debug)]
pub struct UploadOptions {
    /// Maximum number of segments in flight. `0` means the default.
    pub concurrency: usize,

    /// Maximum segment size in bytes.
    pub segment_size: u64,

    /// Expiry applied to the segments and the manifest.
    pub delete_at: Option<DateTime<Utc>>,

    /// Fixed pause after a failed segment attempt.
    pub segment_backoff: Duration,

    /// Per-request timeout for segment checks and uploads.
    pub segment_timeout: Duration,

    /// Per-request timeout for manifest creation.
    pub manifest_timeout: Duration,

    /// Retry schedule for manifest creation.
    pub manifest_retry: RetryPolicy,

    /// Give up on a segment after this many failed attempts.
    /// `None` retries forever.
    pub max_segment_attempts: Option<u32>,

    /// Service catalog entry holding the storage endpoint.
    pub service_name: String,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            segment_size: DEFAULT_SEGMENT_SIZE,
            delete_at: None,
            segment_backoff: DEFAULT_SEGMENT_BACKOFF,
            segment_timeout: DEFAULT_SEGMENT_TIMEOUT,
            manifest_timeout: DEFAULT_MANIFEST_TIMEOUT,
            manifest_retry: RetryPolicy::default(),
            max_segment_attempts: None,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl UploadOptions {
    /// Concurrency with the `0 => default` rule applied.
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            self.concurrency
        }
    }

    /// Expiry as the unix timestamp Swift expects in `X-Delete-At`.
    pub fn delete_at_timestamp(&self) -> Option<i64> {
        self.delete_at.map(|at| at.timestamp())
    }

    pub fn validate(&self) -> UploadResult<()> {
        if self.segment_size == 0 {
            return Err(UploadError::InvalidOptions(
                "segment size must be greater than zero".into(),
            ));
        }
        if self.max_segment_attempts == Some(0) {
            return Err(UploadError::InvalidOptions(
                "max segment attempts must be at least 1".into(),
            ));
        }
        if self.manifest_retry.max_attempts == 0 {
            return Err(UploadError::InvalidOptions(
                "manifest retry needs at least one attempt".into(),
            ));
        }
        if self.service_name.is_empty() {
            return Err(UploadError::InvalidOptions(
                "service name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Aggregate progress reported to the caller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressUpdate {
    /// `total_bytes_sent / file_size`, `1.0` for an empty file.
    pub fraction: f64,

    /// Change of the segment that triggered the update. Negative when an
    /// earlier attempt's bytes are discarded.
    pub delta: i64,

    pub total_bytes_sent: u64,
}

/// One-shot latch guarding the job completion signal.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    fired: bool,
}

impl CompletionLatch {
    /// Returns `true` the first time only.
    pub fn fire(&mut self) -> bool {
        if self.fired {
            false
        } else {
            self.fired = true;
            true
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// A file being uploaded into `container/object_path`.
///
/// The job owns the segment list exclusively; the scheduler is the only
/// writer while the upload runs.
#[derive(Debug)]
pub struct UploadJob {
    /// Identifier used to correlate log lines.
    pub id: Uuid,

    pub container: String,

    /// Name of the final object inside the container.
    pub object_path: String,

    /// Total size of the source.
    pub file_size: u64,

    /// Ordered, contiguous segments covering the whole file.
    pub segments: Vec<Segment>,

    pub concurrency: usize,

    /// Unix timestamp after which the server may delete the objects.
    pub delete_at: Option<i64>,

    pub completion: CompletionLatch,
}

impl UploadJob {
    pub fn new(
        container: impl Into<String>,
        object_path: impl Into<String>,
        file_size: u64,
        segments: Vec<Segment>,
        options: &UploadOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            container: container.into(),
            object_path: object_path.into(),
            file_size,
            segments,
            concurrency: options.effective_concurrency(),
            delete_at: options.delete_at_timestamp(),
            completion: CompletionLatch::default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.segments.iter().all(|segment| segment.done)
    }

    /// A manifest is only needed when the file was actually split.
    pub fn needs_manifest(&self) -> bool {
        self.segments.len() > 1
    }

    /// Sum of per-segment progress, including partially sent segments.
    pub fn bytes_sent(&self) -> u64 {
        self.segments.iter().map(|segment| segment.bytes_sent).sum()
    }

    /// Bytes belonging to segments confirmed on the server.
    pub fn completed_bytes(&self) -> u64 {
        self.segments
            .iter()
            .filter(|segment| segment.done)
            .map(|segment| segment.size)
            .sum()
    }

    pub fn progress_fraction(&self) -> f64 {
        if self.file_size == 0 {
            1.0
        } else {
            self.bytes_sent() as f64 / self.file_size as f64
        }
    }
}
