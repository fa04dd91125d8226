//! Request body stream handed to backend applications.
//!
//! A body is "bytes already buffered while the head was parsed" followed by
//! "whatever is still on the socket". When the request declared a
//! Content-Length the reader never hands out more than that.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Read size used when the caller does not bound a read.
pub const CHUNK_SIZE: usize = 8192;

/// Body source boxed so the same reader works over TCP, TLS and test pipes.
pub type BodySource = Box<dyn AsyncRead + Send + Unpin>;

/// The backend application's input stream.
pub struct BodyReader {
    prefix: Vec<u8>,
    source: Option<BodySource>,
    remaining: Option<u64>,
}

impl fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyReader")
            .field("buffered", &self.prefix.len())
            .field("remaining", &self.remaining)
            .field("eof", &self.source.is_none())
            .finish()
    }
}

impl BodyReader {
    /// Create a reader over buffered `prefix` bytes and a live `source`.
    /// `content_length` of `None` means "until EOF".
    pub fn new(prefix: Vec<u8>, source: BodySource, content_length: Option<u64>) -> Self {
        Self {
            prefix,
            source: Some(source),
            remaining: content_length,
        }
    }

    /// A reader that is already at EOF.
    pub fn empty() -> Self {
        Self {
            prefix: Vec::new(),
            source: None,
            remaining: Some(0),
        }
    }

    /// Bytes still expected when a Content-Length was declared.
    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    /// Read up to `n` bytes, or, with `None`, everything that is left.
    ///
    /// Returns fewer bytes only at EOF or when the declared length is
    /// exhausted. After EOF every call returns an empty vector.
    pub async fn read(&mut self, n: Option<usize>) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let want = match n {
                Some(n) if out.len() >= n => break,
                Some(n) => n - out.len(),
                None => CHUNK_SIZE,
            };
            let chunk = self.next_chunk(want).await?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Read the rest of the body.
    pub async fn read_to_end(&mut self) -> std::io::Result<Vec<u8>> {
        self.read(None).await
    }

    /// One chunk of at most `limit` bytes: buffered bytes first, then a
    /// single socket read.
    async fn next_chunk(&mut self, limit: usize) -> std::io::Result<Vec<u8>> {
        let limit = match self.remaining {
            Some(0) => return Ok(Vec::new()),
            Some(remaining) => limit.min(usize::try_from(remaining).unwrap_or(usize::MAX)),
            None => limit,
        };

        let chunk = if !self.prefix.is_empty() {
            let take = limit.min(self.prefix.len());
            self.prefix.drain(..take).collect::<Vec<u8>>()
        } else if let Some(source) = self.source.as_mut() {
            let mut buf = vec![0u8; limit];
            let read = match source.read(&mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    self.source = None;
                    return Err(e);
                }
            };
            if read == 0 {
                self.source = None;
            }
            buf.truncate(read);
            buf
        } else {
            Vec::new()
        };

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(chunk.len() as u64);
        }
        Ok(chunk)
    }
}
