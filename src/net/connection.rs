//! Per-connection state.
//!
//! # Responsibilities
//! - Generate unique request IDs for log correlation
//! - Wrap plain and TLS client streams behind one type
//! - Own the client socket from accept() until it is closed, exactly once
//!
//! # Design Decisions
//! - One connection carries one request (`Connection: close` is forced)
//! - The record is owned by whichever task is currently responsible for it
//!   (reader, then the service worker); services never hold it

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::http::head::HttpHead;
use crate::net::tls::PeerIdentity;

/// Per-process request counter.
/// Relaxed ordering is enough: we only need uniqueness, not synchronization.
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Random per-process salt, so ids from sibling processes never collide.
static PROCESS_SALT: OnceLock<String> = OnceLock::new();

fn process_salt() -> &'static str {
    PROCESS_SALT.get_or_init(|| {
        let random = uuid::Uuid::new_v4().simple().to_string();
        format!("{:03}{}", std::process::id() % 1000, &random[..6])
    })
}

/// Unique identifier for a request, e.g. `417a9c03e-1f`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new unique request ID.
    pub fn new() -> Self {
        let n = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{}-{:x}", process_salt(), n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An accepted client stream, with or without TLS.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientStream::Plain(_) => f.write_str("ClientStream::Plain"),
            ClientStream::Tls(_) => f.write_str("ClientStream::Tls"),
        }
    }
}

impl ClientStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls(_))
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One accepted TCP connection for its entire lifetime.
#[derive(Debug)]
pub struct ConnectionRecord {
    /// Unique request id.
    pub id: RequestId,
    /// Port the connection was accepted on.
    pub server_port: u16,
    /// Peer address.
    pub client_addr: SocketAddr,
    /// Parsed head; empty until the reader fills it.
    pub head: HttpHead,
    /// Body bytes read together with the head.
    pub body_prefix: Vec<u8>,
    /// Peer certificate names when TLS is active and a client cert was sent.
    pub tls_info: Option<PeerIdentity>,
    /// Name of the service that matched, for logging.
    pub service_name: Option<String>,
    /// Matched prefix with trailing slashes removed (`SCRIPT_NAME`).
    pub script_name: String,
    /// Application source reported as `SCRIPT_FILENAME`.
    pub script_filename: String,
    /// Whether the stream is TLS, kept after the stream is handed out.
    pub secure: bool,
    stream: Option<ClientStream>,
}

impl ConnectionRecord {
    /// Create a record for a freshly accepted stream.
    pub fn new(server_port: u16, stream: ClientStream, client_addr: SocketAddr) -> Self {
        let secure = stream.is_tls();
        Self {
            id: RequestId::new(),
            server_port,
            client_addr,
            head: HttpHead::new(),
            body_prefix: Vec::new(),
            tls_info: None,
            service_name: None,
            script_name: String::new(),
            script_filename: String::new(),
            secure,
            stream: Some(stream),
        }
    }

    /// Swap the stream, e.g. after a TLS upgrade.
    pub fn replace_stream(&mut self, stream: ClientStream) {
        self.secure = stream.is_tls();
        self.stream = Some(stream);
    }

    /// Borrow the stream while it is still owned by the record.
    pub fn stream_mut(&mut self) -> Option<&mut ClientStream> {
        self.stream.as_mut()
    }

    /// Move the stream out. The caller becomes responsible for closing it.
    pub fn take_stream(&mut self) -> Option<ClientStream> {
        self.stream.take()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Write raw bytes if the stream is still open. Errors are returned,
    /// not logged: the caller knows which phase failed.
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await
            }
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "connection already closed")),
        }
    }

    /// Close the socket. Safe to call more than once; only the first call
    /// touches the socket.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::trace!(request_id = %self.id, error = %e, "Shutdown on close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn request_ids_unique() {
        let ids: HashSet<_> = (0..10_000).map(|_| RequestId::new()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn request_ids_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..1000).map(|_| RequestId::new()).collect::<Vec<_>>()))
            .collect();
        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id));
            }
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, peer) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();

        let mut record = ConnectionRecord::new(addr.port(), ClientStream::Plain(stream), peer);
        assert!(record.is_open());
        record.close().await;
        assert!(!record.is_open());
        record.close().await;
        assert!(record.send(b"x").await.is_err());
    }
}
