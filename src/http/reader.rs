//! Per-connection request reader.
//!
//! # Responsibilities
//! - Run the TLS handshake when the listener is TLS-enabled
//! - Read and parse the request head under one deadline
//! - Dispatch the parsed request, or answer the client with 400/404/503
//!
//! # State Machine
//! ```text
//! Accepted → [WrappingTls] → ReadingHeaders → Dispatching → AcceptedByService
//!                  │                │              └──────→ Rejected (404/503)
//!                  └────────────────┴────────────────────→ Failed (400 or silent close)
//! ```
//!
//! # Design Decisions
//! - The header timeout covers the handshake and the whole head; a slow
//!   client cannot hold a reader longer than that
//! - A 400 is sent only when the head terminator was seen; timeouts, socket
//!   errors and oversized heads close silently
//! - Every path that ends here closes the socket through
//!   [`ConnectionRecord::close`] and logs exactly one line; accepted requests
//!   are logged by the service worker when they complete

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::http::head::HttpHead;
use crate::http::response::status_response;
use crate::net::connection::{ClientStream, ConnectionRecord, RequestId};
use crate::net::tls::TlsTerminator;
use crate::observability::metrics;
use crate::routing::router::{DispatchResult, Dispatcher};

const READ_CHUNK: usize = 8192;

/// States a connection goes through before a service takes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Accepted,
    WrappingTls,
    ReadingHeaders,
    Dispatching,
    AcceptedByService,
    Rejected,
    Failed,
}

/// What every reader on a listener shares.
#[derive(Debug, Clone)]
pub struct ReaderContext {
    pub dispatcher: Arc<Dispatcher>,
    pub tls: Option<TlsTerminator>,
    pub header_timeout: Duration,
    pub max_header_bytes: usize,
    pub server_port: u16,
}

/// Drives one accepted connection up to the hand-off to a service.
pub struct RequestReader<'a> {
    ctx: &'a ReaderContext,
    state: ReaderState,
}

impl<'a> RequestReader<'a> {
    pub fn new(ctx: &'a ReaderContext) -> Self {
        Self {
            ctx,
            state: ReaderState::Accepted,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    fn transition(&mut self, next: ReaderState, client: SocketAddr) {
        tracing::trace!(client = %client, from = ?self.state, to = ?next, "Reader state");
        self.state = next;
    }

    /// Run the connection to a terminal state and return it.
    pub async fn run(mut self, stream: TcpStream, client: SocketAddr) -> ReaderState {
        let deadline = Instant::now() + self.ctx.header_timeout;

        let (stream, identity) = match &self.ctx.tls {
            Some(tls) => {
                self.transition(ReaderState::WrappingTls, client);
                let handshake = tokio::time::timeout_at(deadline, tls.wrap(stream)).await;
                match handshake {
                    Ok(Ok((tls_stream, identity))) => (ClientStream::Tls(Box::new(tls_stream)), identity),
                    Ok(Err(e)) => return self.fail_tls(client, &e.to_string()),
                    Err(_) => return self.fail_tls(client, "handshake timed out"),
                }
            }
            None => (ClientStream::Plain(stream), None),
        };

        let mut conn = ConnectionRecord::new(self.ctx.server_port, stream, client);
        conn.tls_info = identity;
        conn.head = HttpHead::with_limit(self.ctx.max_header_bytes);

        self.transition(ReaderState::ReadingHeaders, client);
        let read_error = read_head(&mut conn, deadline).await;

        let head = &conn.head;
        if !(head.is_complete() && head.is_valid() && head.is_request()) {
            self.transition(ReaderState::Failed, client);
            metrics::record_rejected("invalid");
            let reason = head
                .error()
                .map(str::to_string)
                .or(read_error)
                .unwrap_or_else(|| "not a request".to_string());
            if head.is_complete() {
                tracing::debug!(request_id = %conn.id, reason = %reason, "Invalid request");
                respond(&mut conn, 400, "Bad Request", "Invalid request", self.ctx.header_timeout).await;
                log_rejected(&conn, "invalid request");
            } else {
                tracing::info!(
                    target: "requests",
                    request_id = %conn.id,
                    outcome = "read_error",
                    reason = %reason,
                    "{} {}:{} :{} (request reading error)",
                    conn.id,
                    client.ip(),
                    client.port(),
                    self.ctx.server_port
                );
            }
            conn.close().await;
            return self.state;
        }

        self.transition(ReaderState::Dispatching, client);
        match self.ctx.dispatcher.dispatch(conn).await {
            DispatchResult::Accepted { service } => {
                tracing::trace!(client = %client, service = %service, "Handed off");
                self.transition(ReaderState::AcceptedByService, client);
            }
            DispatchResult::NoMatch(mut conn) => {
                self.transition(ReaderState::Rejected, client);
                metrics::record_rejected("no_match");
                respond(&mut conn, 404, "Not Found", "Service not found", self.ctx.header_timeout).await;
                log_rejected(&conn, "no match");
                conn.close().await;
            }
            DispatchResult::Unavailable(mut conn) => {
                self.transition(ReaderState::Rejected, client);
                metrics::record_rejected("unavailable");
                respond(
                    &mut conn,
                    503,
                    "Service Unavailable",
                    "Service unavailable",
                    self.ctx.header_timeout,
                )
                .await;
                log_rejected(&conn, "service unavailable");
                conn.close().await;
            }
        }
        self.state
    }

    /// The stream was consumed by the failed handshake and is already closed.
    fn fail_tls(&mut self, client: SocketAddr, error: &str) -> ReaderState {
        self.transition(ReaderState::Failed, client);
        metrics::record_rejected("tls");
        tracing::info!(
            target: "requests",
            request_id = %RequestId::new(),
            outcome = "tls_failed",
            error = %error,
            "{}:{} :{} (TLS handshake failed: {})",
            client.ip(),
            client.port(),
            self.ctx.server_port,
            error
        );
        self.state
    }
}

/// Read until the head completes, fails, the peer goes away or the deadline
/// passes. Returns a description of a read failure, if any.
async fn read_head(conn: &mut ConnectionRecord, deadline: Instant) -> Option<String> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let stream = conn.stream_mut()?;
        let read = match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) => return Some("connection closed by peer".to_string()),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Some(format!("read error: {e}")),
            Err(_) => return Some("header read timed out".to_string()),
        };
        let consumed = conn.head.consume(&buf[..read]);
        if consumed.complete {
            conn.body_prefix = consumed.leftover;
            return None;
        }
        if consumed.error {
            return None;
        }
    }
}

/// Best-effort synthesized response; write errors only get logged.
async fn respond(conn: &mut ConnectionRecord, code: u16, reason: &str, body: &str, limit: Duration) {
    let bytes = status_response(code, reason, conn.id.as_str(), body);
    match tokio::time::timeout(limit, conn.send(&bytes)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(request_id = %conn.id, error = %e, "Failed to send {}", code),
        Err(_) => tracing::debug!(request_id = %conn.id, "Timed out sending {}", code),
    }
}

fn log_rejected(conn: &ConnectionRecord, reason: &str) {
    tracing::info!(
        target: "requests",
        request_id = %conn.id,
        outcome = "rejected",
        reason = %reason,
        "{} {}:{} :{} {} {} -> ({})",
        conn.id,
        conn.client_addr.ip(),
        conn.client_addr.port(),
        conn.server_port,
        conn.head.method().unwrap_or("-"),
        conn.head.original_uri().unwrap_or("-"),
        reason
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::routing::router::ServiceTable;
    use crate::service::app::{from_fn, Application, Reply, Request};
    use crate::service::backend::BackendService;
    use crate::service::registry::{AppArgs, AppSpec, BackendHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn context(services: Vec<Arc<BackendService>>, header_timeout: Duration) -> ReaderContext {
        ReaderContext {
            dispatcher: Arc::new(Dispatcher::new(ServiceTable::new(1, services))),
            tls: None,
            header_timeout,
            max_header_bytes: 1024,
            server_port: 0,
        }
    }

    fn counting_service(prefix: &str, hits: Arc<AtomicUsize>, queue_capacity: usize) -> Arc<BackendService> {
        let app: Arc<dyn Application> = Arc::new(from_fn(move |_req: Request| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(Reply::text("200 OK", "hit"))
            }
        }));
        let mut config = ServiceConfig::new("counting", prefix, "test");
        config.max_workers = 1;
        config.queue_capacity = queue_capacity;
        let spec = AppSpec {
            app: "test".to_string(),
            args: AppArgs::new(),
            source_path: None,
        };
        BackendService::with_handle(config, spec.clone(), BackendHandle::new(app, spec))
    }

    /// Send `payload` (then keep or close the write side) and run one reader.
    async fn exchange(ctx: &ReaderContext, payload: &[u8], close_write: bool) -> (ReaderState, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let payload = payload.to_vec();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&payload).await.unwrap();
            if close_write {
                stream.shutdown().await.unwrap();
            }
            let mut out = Vec::new();
            let _ = stream.read_to_end(&mut out).await;
            String::from_utf8_lossy(&out).into_owned()
        });
        let (stream, peer) = listener.accept().await.unwrap();
        let state = RequestReader::new(ctx).run(stream, peer).await;
        (state, client.await.unwrap())
    }

    #[tokio::test]
    async fn dispatches_valid_request() {
        let hits = Arc::new(AtomicUsize::new(0));
        let ctx = context(vec![counting_service("/", hits.clone(), 0)], Duration::from_secs(5));
        let (state, text) = exchange(&ctx, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n", false).await;
        assert_eq!(state, ReaderState::AcceptedByService);
        assert!(text.ends_with("hit"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_headline_gets_400() {
        let ctx = context(Vec::new(), Duration::from_secs(5));
        let (state, text) = exchange(&ctx, b"NOTHTTP garbage\r\n\r\n", false).await;
        assert_eq!(state, ReaderState::Failed);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.ends_with("Invalid request"));
    }

    #[tokio::test]
    async fn non_http_protocol_gets_400() {
        let ctx = context(Vec::new(), Duration::from_secs(5));
        let (state, text) = exchange(&ctx, b"GET / FTP/1.0\r\n\r\n", false).await;
        assert_eq!(state, ReaderState::Failed);
        assert!(text.starts_with("HTTP/1.1 400 "));
    }

    #[tokio::test]
    async fn incomplete_head_closes_silently() {
        let ctx = context(Vec::new(), Duration::from_secs(5));
        let (state, text) = exchange(&ctx, b"GET / HTTP/1.1\r\nHost: h\r\n", true).await;
        assert_eq!(state, ReaderState::Failed);
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn slow_client_times_out_silently() {
        let ctx = context(Vec::new(), Duration::from_millis(100));
        let started = std::time::Instant::now();
        let (state, text) = exchange(&ctx, b"GET / HTTP/1.1\r\n", false).await;
        assert_eq!(state, ReaderState::Failed);
        assert!(text.is_empty());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn oversized_head_closes_silently() {
        let ctx = context(Vec::new(), Duration::from_secs(5));
        let mut payload = b"GET / HTTP/1.1\r\n".to_vec();
        payload.extend(std::iter::repeat(b'a').take(4096));
        let (state, text) = exchange(&ctx, &payload, false).await;
        assert_eq!(state, ReaderState::Failed);
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn unmatched_prefix_gets_404_without_invoking_backend() {
        let hits = Arc::new(AtomicUsize::new(0));
        let ctx = context(vec![counting_service("/echo", hits.clone(), 0)], Duration::from_secs(5));
        let (state, text) = exchange(&ctx, b"GET /other HTTP/1.1\r\n\r\n", false).await;
        assert_eq!(state, ReaderState::Rejected);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("Service not found"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closed_service_gets_503() {
        let hits = Arc::new(AtomicUsize::new(0));
        let service = counting_service("/", hits.clone(), 0);
        service.close().await;
        let ctx = context(vec![service], Duration::from_secs(5));
        let (state, text) = exchange(&ctx, b"GET / HTTP/1.1\r\n\r\n", false).await;
        assert_eq!(state, ReaderState::Rejected);
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
