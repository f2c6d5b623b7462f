//! Error types shared by the upload engine.
//!
//! Two layers: [`TransportError`] describes what happened to a single HTTP
//! request, [`UploadError`] classifies failures of the upload itself. Only a
//! few `UploadError` kinds are fatal to a job; the rest are retried per
//! segment and never reach the caller.

use std::io;
use thiserror::Error;

/// Failure of one request issued through a [`crate::services::transport::Transport`].
///
/// `NotFound` and `ServiceUnavailable` are kept apart from the generic
/// `Status` variant because the existence check treats both as "absent".
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("remote object not found (404)")]
    NotFound,
    #[error("service unavailable (503)")]
    ServiceUnavailable,
    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request timed out")]
    Timeout,
    #[error("network failure: {0}")]
    Network(String),
}

impl TransportError {
    /// Map an HTTP status >= 400 to the matching variant.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            404 => Self::NotFound,
            503 => Self::ServiceUnavailable,
            _ => Self::Status {
                status,
                body: body.into(),
            },
        }
    }

    /// True for the two statuses the existence check reads as "segment absent".
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::NotFound | Self::ServiceUnavailable)
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("failed to hash segment {index}: {source}")]
    Hash {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request failed with HTTP status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("manifest creation failed after {attempts} attempts: {source}")]
    Manifest {
        attempts: u32,
        #[source]
        source: Box<UploadError>,
    },
    #[error("segment {index} failed {attempts} attempts, last error: {source}")]
    SegmentRetriesExhausted {
        index: usize,
        attempts: u32,
        #[source]
        source: Box<UploadError>,
    },
    #[error("invalid upload options: {0}")]
    InvalidOptions(String),
    /// The manifest was requested before every segment was stored.
    #[error("manifest not ready: {0}")]
    ManifestNotReady(String),
    #[error("failed to encode manifest: {0}")]
    Encode(#[from] serde_json::Error),
}

impl UploadError {
    /// Shortcut for an authentication failure.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Whether this error aborts the job instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Auth(_)
                | Self::Manifest { .. }
                | Self::SegmentRetriesExhausted { .. }
                | Self::InvalidOptions(_)
                | Self::ManifestNotReady(_)
                | Self::Encode(_)
        )
    }
}

impl From<TransportError> for UploadError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound => UploadError::Status {
                status: 404,
                body: String::new(),
            },
            TransportError::ServiceUnavailable => UploadError::Status {
                status: 503,
                body: String::new(),
            },
            TransportError::Status { status, body } => UploadError::Status { status, body },
            TransportError::Timeout => UploadError::Transport("request timed out".into()),
            TransportError::Network(msg) => UploadError::Transport(msg),
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Fatal outcome handed back to the caller along with the bytes that did
/// make it to the server before the job stopped.
#[derive(Debug, Error)]
#[error("{source} ({bytes_sent} bytes sent)")]
pub struct UploadFailure {
    #[source]
    pub source: UploadError,
    pub bytes_sent: u64,
}

impl UploadFailure {
    pub fn new(source: UploadError, bytes_sent: u64) -> Self {
        Self { source, bytes_sent }
    }
}
