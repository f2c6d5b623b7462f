//! Represents one byte range of the source file uploaded as its own object.

/// Object-name prefix under which content-addressed segments are stored.
pub const SEGMENT_PREFIX: &str = "segments";

/// A contiguous slice `[start, end)` of the source file.
///
/// Segments are created by the planner and owned by the job. An upload
/// attempt works on a copy and hands it back to the scheduler when it
/// finishes, so the job's list is the single source of truth.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Position of this segment in the file (0-based).
    pub index: usize,

    /// First byte offset (inclusive).
    pub start: u64,

    /// Last byte offset (exclusive).
    pub end: u64,

    /// `end - start`.
    pub size: u64,

    /// Hex MD5 of the segment bytes, cached across attempts once computed.
    pub digest: Option<String>,

    /// Object name inside the target container.
    pub remote_path: Option<String>,

    /// Bytes of this segment known to be on the server.
    pub bytes_sent: u64,

    /// Set after a successful upload or a verified remote copy.
    pub done: bool,
}

impl Segment {
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            size: end - start,
            digest: None,
            remote_path: None,
            bytes_sent: 0,
            done: false,
        }
    }

    /// Mark the segment as stored remotely.
    pub fn mark_done(&mut self) {
        self.done = true;
        self.bytes_sent = self.size;
    }

    /// Forget progress from a previous attempt that turned out not to stick.
    pub fn reset_progress(&mut self) {
        self.bytes_sent = 0;
    }
}

/// Content-addressed object name for a digest.
pub fn segment_object_path(digest: &str) -> String {
    format!("{}/{}", SEGMENT_PREFIX, digest)
}
