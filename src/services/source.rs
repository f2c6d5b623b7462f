//! Byte sources the uploader can read segments from.

use bytes::Bytes;
use futures::{Stream, stream};
use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;

/// Read buffer used when streaming file ranges.
const READ_CHUNK: usize = 64 * 1024;

/// Stream of byte chunks as consumed by the transport and the hasher.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// An immutable source of bytes with a known length.
///
/// Each call to [`ByteSource::read_range`] starts an independent sequential
/// read, so a segment can be hashed and then uploaded (or uploaded again
/// after a failure) without buffering it.
pub trait ByteSource: Send + Sync {
    fn size(&self) -> u64;

    fn read_range(
        &self,
        start: u64,
        end: u64,
    ) -> impl Future<Output = io::Result<ByteStream>> + Send;
}

/// A file on local disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    /// Open `path` and record its current length.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(Self {
            path,
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component, used as the default object name.
    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

impl ByteSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, start: u64, end: u64) -> io::Result<ByteStream> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let reader = file.take(end.saturating_sub(start));
        Ok(Box::pin(ReaderStream::with_capacity(reader, READ_CHUNK)))
    }
}

impl ByteSource for Bytes {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    async fn read_range(&self, start: u64, end: u64) -> io::Result<ByteStream> {
        let len = self.len() as u64;
        if start > end || end > len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {}..{} outside buffer of {} bytes", start, end, len),
            ));
        }
        let slice = self.slice(start as usize..end as usize);
        let chunks: Vec<io::Result<Bytes>> = (0..slice.len())
            .step_by(READ_CHUNK)
            .map(|offset| Ok(slice.slice(offset..(offset + READ_CHUNK).min(slice.len()))))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}
