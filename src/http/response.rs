//! Outbound response handling.
//!
//! # Responsibilities
//! - Buffer the status line and headers given to `start_response`
//! - Force `Connection: close` and append the request id header
//! - Send the head lazily, right before the first body bytes
//! - Synthesize the plain-text error responses used by the reader and workers
//!
//! # Design Decisions
//! - Once any byte has been sent the response is "committed": an error after
//!   that point aborts the connection instead of writing a second status line
//! - Header names/values are written as given; apps own their content

use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Header name carrying the request id on every response.
pub const X_REQUEST_ID: &str = "X-Request-Id";

/// Interim response sent for `Expect: 100-continue`.
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Response sink boxed so the same writer works over TCP, TLS and test pipes.
pub type ResponseSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors surfaced to applications writing a response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("start_response must be called before writing the body")]
    NotStarted,
    #[error("response head already sent")]
    AlreadyCommitted,
    #[error("invalid status line: {0:?}")]
    InvalidStatus(String),
    #[error("connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build a complete, self-contained plain-text response.
pub fn status_response(code: u16, reason: &str, request_id: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {code} {reason}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         {X_REQUEST_ID}: {request_id}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

/// Streams one response back to the client.
pub struct ResponseWriter {
    sink: Option<ResponseSink>,
    request_id: String,
    pending_head: Option<Vec<u8>>,
    status: Option<u16>,
    committed: bool,
    bytes_written: u64,
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("request_id", &self.request_id)
            .field("status", &self.status)
            .field("committed", &self.committed)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

impl ResponseWriter {
    pub fn new(sink: ResponseSink, request_id: impl Into<String>) -> Self {
        Self {
            sink: Some(sink),
            request_id: request_id.into(),
            pending_head: None,
            status: None,
            committed: false,
            bytes_written: 0,
        }
    }

    /// Record the status line (e.g. `"200 OK"`) and headers.
    ///
    /// May be called again to replace the head as long as nothing has been
    /// sent yet.
    pub fn start_response<K, V>(
        &mut self,
        status: &str,
        headers: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), ResponseError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        if self.committed {
            return Err(ResponseError::AlreadyCommitted);
        }
        let status = status.trim();
        let code = status
            .split_whitespace()
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .filter(|c| (100..1000).contains(c))
            .ok_or_else(|| ResponseError::InvalidStatus(status.to_string()))?;

        let mut head = format!("HTTP/1.1 {status}\r\n");
        for (name, value) in headers {
            let name = name.as_ref();
            if name.eq_ignore_ascii_case("connection") {
                continue;
            }
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value.as_ref());
            head.push_str("\r\n");
        }
        head.push_str("Connection: close\r\n");
        head.push_str(&format!("{X_REQUEST_ID}: {}\r\n\r\n", self.request_id));

        self.status = Some(code);
        self.pending_head = Some(head.into_bytes());
        Ok(())
    }

    /// Send body bytes, preceded by the head on the first call.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), ResponseError> {
        self.flush_head().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        let sink = self.sink.as_mut().ok_or(ResponseError::Closed)?;
        sink.write_all(chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Send the `100 Continue` interim response. Does not commit the response.
    pub async fn send_continue(&mut self) -> Result<(), ResponseError> {
        if self.committed {
            return Err(ResponseError::AlreadyCommitted);
        }
        let sink = self.sink.as_mut().ok_or(ResponseError::Closed)?;
        sink.write_all(CONTINUE).await?;
        sink.flush().await?;
        Ok(())
    }

    /// True once the status line has gone out on the wire.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// True if `start_response` has been called.
    pub fn is_started(&self) -> bool {
        self.status.is_some()
    }

    /// Status code given to `start_response`, if any.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Body bytes sent so far (head excluded).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Replace whatever was prepared with a plain-text error response.
    /// Only possible before the response is committed.
    pub async fn send_error(&mut self, code: u16, reason: &str, body: &str) -> Result<(), ResponseError> {
        if self.committed {
            return Err(ResponseError::AlreadyCommitted);
        }
        let bytes = status_response(code, reason, &self.request_id, body);
        let sink = self.sink.as_mut().ok_or(ResponseError::Closed)?;
        self.pending_head = None;
        self.status = Some(code);
        self.committed = true;
        sink.write_all(&bytes).await?;
        self.bytes_written += body.len() as u64;
        Ok(())
    }

    /// Flush everything and shut the write side down.
    /// A started but still unsent head is sent with an empty body.
    pub async fn finish(&mut self) -> Result<(), ResponseError> {
        self.flush_head().await?;
        if let Some(mut sink) = self.sink.take() {
            sink.flush().await?;
            sink.shutdown().await?;
        }
        Ok(())
    }

    /// Drop the connection without sending anything more.
    pub fn abort(&mut self) {
        self.pending_head = None;
        self.sink = None;
    }

    async fn flush_head(&mut self) -> Result<(), ResponseError> {
        if self.committed {
            return Ok(());
        }
        let head = self.pending_head.take().ok_or(ResponseError::NotStarted)?;
        let sink = self.sink.as_mut().ok_or(ResponseError::Closed)?;
        self.committed = true;
        sink.write_all(&head).await?;
        Ok(())
    }
}
