//! Byte sources for recording streams

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::error::TransportError;

/// Read size for file-backed recordings
pub const CHUNK_SIZE: usize = 4096;

/// A sequential byte stream delivered in chunks.
#[async_trait]
pub trait StreamSource: Send {
    /// Next chunk, or `None` once the stream is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Human readable origin, for logs.
    fn describe(&self) -> String;
}

/// Recording fetched over HTTP(S) with a streaming GET.
///
/// Body chunks are handed out in pieces of at most [`CHUNK_SIZE`] bytes, like
/// [`FileSource`].
pub struct HttpSource {
    url: String,
    response: reqwest::Response,
    pending: Bytes,
}

impl HttpSource {
    pub async fn open(client: &reqwest::Client, url: &str) -> Result<Self, TransportError> {
        let response = client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        info!("📥 Streaming recording from {} (HTTP {})", url, status.as_u16());
        Ok(Self {
            url: url.to_string(),
            response,
            pending: Bytes::new(),
        })
    }
}

#[async_trait]
impl StreamSource for HttpSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        while self.pending.is_empty() {
            match self.response.chunk().await? {
                Some(chunk) => self.pending = chunk,
                None => return Ok(None),
            }
        }
        let n = self.pending.len().min(CHUNK_SIZE);
        Ok(Some(self.pending.split_to(n)))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Recording stored on the local filesystem.
pub struct FileSource {
    path: PathBuf,
    file: File,
    buf: Vec<u8>,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        info!("📥 Reading recording from {:?}", path);
        Ok(Self {
            path,
            file,
            buf: vec![0u8; CHUNK_SIZE],
        })
    }
}

#[async_trait]
impl StreamSource for FileSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        let n = self.file.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory chunks, optionally paced, ending with an optional error.
pub struct ChunkSource {
    chunks: VecDeque<Bytes>,
    delay: Option<Duration>,
    fail_with: Option<TransportError>,
}

impl ChunkSource {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            delay: None,
            fail_with: None,
        }
    }

    /// Split one buffer into chunks of `size` bytes.
    pub fn split(data: impl AsRef<[u8]>, size: usize) -> Self {
        let data = data.as_ref();
        Self::new(data.chunks(size.max(1)).map(Bytes::copy_from_slice).collect::<Vec<_>>())
    }

    /// Sleep before handing out each chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail with `error` once the chunks run out.
    pub fn failing_with(mut self, error: TransportError) -> Self {
        self.fail_with = Some(error);
        self
    }
}

#[async_trait]
impl StreamSource for ChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.chunks.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None => match self.fail_with.take() {
                Some(e) => Err(e),
                None => Ok(None),
            },
        }
    }

    fn describe(&self) -> String {
        format!("memory ({} chunks left)", self.chunks.len())
    }
}

/// Build the shared HTTP client used by every job of a batch.
pub fn http_client(connect_timeout: Duration, insecure: bool) -> Result<reqwest::Client, TransportError> {
    Ok(reqwest::Client::builder()
        .user_agent(concat!("guacshot/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(connect_timeout)
        .danger_accept_invalid_certs(insecure)
        .build()?)
}

/// Open the right source for `location`: `http(s)://` URLs go through
/// `client`, `file://` URLs and bare paths are read from disk.
pub async fn open(client: &reqwest::Client, location: &str) -> Result<Box<dyn StreamSource>, TransportError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(HttpSource::open(client, location).await?))
    } else {
        let path = location.strip_prefix("file://").unwrap_or(location);
        Ok(Box::new(FileSource::open(path).await?))
    }
}

#[async_trait]
impl StreamSource for Box<dyn StreamSource> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        (**self).next_chunk().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
