//! Represents the body of a Swift static-large-object manifest.

use serde::{Deserialize, Serialize};

/// One line of the manifest, pointing at an uploaded segment.
///
/// Field names on the wire follow the Swift SLO format (`etag`,
/// `size_bytes`); `path` is `<container>/<object>`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Container-qualified object path of the segment.
    pub path: String,

    /// Hex MD5 the server must find on the segment.
    #[serde(rename = "etag")]
    pub digest: String,

    /// Exact segment length.
    pub size_bytes: u64,
}
