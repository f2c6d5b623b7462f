//! Segmented uploads of large files into Swift-compatible object storage.
//!
//! Files are cut into fixed-size segments stored under content-addressed
//! names (`<container>/segments/<md5>`), uploaded with bounded concurrency
//! and stitched together by a static-large-object manifest. Segments that
//! already exist remotely with a matching digest are not sent again, which
//! makes interrupted uploads resumable.

pub mod errors;
pub mod models;
pub mod services;

#[cfg(test)]
mod test_support;

pub use errors::{TransportError, UploadError, UploadFailure};
pub use models::job::{ProgressUpdate, UploadJob, UploadOptions};
pub use services::auth::{Authenticator, Credentials, KeystoneAuthenticator};
pub use services::source::{ByteSource, FileSource};
pub use services::transport::{ReqwestTransport, Transport};
pub use services::uploader::SwiftUploader;
