//! Splits a file into fixed-size segments.

use crate::models::segment::Segment;

/// Partition `[0, file_size)` into segments of at most `max_segment_size`
/// bytes, in order.
///
/// A single-segment plan is uploaded straight to `object_path`, so its
/// remote path is filled in here. An empty file still gets one zero-length
/// segment, which becomes an empty object.
pub fn plan_segments(file_size: u64, max_segment_size: u64, object_path: &str) -> Vec<Segment> {
    let max_segment_size = max_segment_size.max(1);
    let mut segments = Vec::new();
    let mut pos = 0;
    while pos < file_size {
        let size = (file_size - pos).min(max_segment_size);
        segments.push(Segment::new(segments.len(), pos, pos + size));
        pos += size;
    }
    if segments.is_empty() {
        segments.push(Segment::new(0, 0, 0));
    }
    if let [only] = segments.as_mut_slice() {
        only.remote_path = Some(object_path.to_string());
    }
    segments
}
