//! Core data model of a segmented upload.
//!
//! A file is cut into [`segment::Segment`]s owned by an [`job::UploadJob`];
//! once every segment is stored remotely the job is stitched back together
//! by a list of [`manifest::ManifestEntry`] values.

pub mod job;
pub mod manifest;
pub mod segment;
