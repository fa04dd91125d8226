//! The listening server.
//!
//! # Responsibilities
//! - Own the listening socket and the accept loop
//! - Start one [`RequestReader`] task per accepted connection
//! - Shut down in order: stop accepting, drain readers, close services
//!
//! # Design Decisions
//! - The listener is owned by the accept task and dropped exactly once when
//!   the loop exits
//! - `close` is idempotent; concurrent callers all wait for the first one
//! - Readers get `shutdown_grace` to finish their head read before they are
//!   aborted. Requests already handed to a service are not affected; the
//!   services drain their own queues when the dispatcher closes

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};

use crate::config::ListenerConfig;
use crate::http::reader::{ReaderContext, RequestReader};
use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal};
use crate::net::listener::{Listener, ListenerError};
use crate::net::tls::TlsTerminator;
use crate::routing::router::Dispatcher;

/// Pause after a failed accept so a persistent error (EMFILE) cannot spin.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

struct Inner {
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    stop: Shutdown,
    closed: Shutdown,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// A running HTTP server. Cloning gives another handle to the same server.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addr", &self.inner.local_addr)
            .field("closing", &self.inner.stop.is_triggered())
            .finish()
    }
}

impl HttpServer {
    /// Bind the configured address and start serving.
    pub fn bind(
        config: &ListenerConfig,
        dispatcher: Arc<Dispatcher>,
        tls: Option<TlsTerminator>,
    ) -> Result<Self, ListenerError> {
        let listener = Listener::bind(config)?;
        Self::start(listener, config, dispatcher, tls)
    }

    /// Serve on an already bound socket, e.g. one inherited from a supervisor.
    pub fn from_std(
        std_listener: std::net::TcpListener,
        config: &ListenerConfig,
        dispatcher: Arc<Dispatcher>,
        tls: Option<TlsTerminator>,
    ) -> Result<Self, ListenerError> {
        let listener = Listener::from_std(std_listener, config.max_connections)?;
        Self::start(listener, config, dispatcher, tls)
    }

    /// Spawn the accept loop. Must be called within a Tokio runtime.
    pub fn start(
        listener: Listener,
        config: &ListenerConfig,
        dispatcher: Arc<Dispatcher>,
        tls: Option<TlsTerminator>,
    ) -> Result<Self, ListenerError> {
        let local_addr = listener.local_addr().map_err(|source| ListenerError::Bind {
            address: config.socket_address(),
            source,
        })?;
        let ctx = Arc::new(ReaderContext {
            dispatcher: dispatcher.clone(),
            tls,
            header_timeout: config.header_timeout(),
            max_header_bytes: config.max_header_bytes,
            server_port: local_addr.port(),
        });

        let stop = Shutdown::new();
        let task = tokio::spawn(accept_loop(
            listener,
            ctx,
            stop.subscribe(),
            config.shutdown_grace(),
        ));

        tracing::info!(
            address = %local_addr,
            tls = config.tls.is_some(),
            "HTTP server started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                local_addr,
                dispatcher,
                stop,
                closed: Shutdown::new(),
                accept_task: Mutex::new(Some(task)),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn is_closing(&self) -> bool {
        self.inner.stop.is_triggered()
    }

    /// Stop accepting, drain readers, then close every service.
    ///
    /// Safe to call any number of times from any task; every call returns
    /// once the shutdown has finished.
    pub async fn close(&self) {
        if !self.inner.stop.trigger() {
            self.wait().await;
            return;
        }
        tracing::info!(address = %self.inner.local_addr, "HTTP server closing");

        let task = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Accept loop ended abnormally");
            }
        }

        self.inner.dispatcher.close().await;
        self.inner.closed.trigger();
        tracing::info!(address = %self.inner.local_addr, "HTTP server stopped");
    }

    /// Wait until a `close` has completed.
    pub async fn wait(&self) {
        self.inner.closed.subscribe().recv().await;
    }
}

async fn accept_loop(listener: Listener, ctx: Arc<ReaderContext>, mut stop: ShutdownSignal, grace: Duration) {
    let mut readers = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, client, permit)) => {
                    let ctx = ctx.clone();
                    readers.spawn(async move {
                        let _permit = permit;
                        RequestReader::new(&ctx).run(stream, client).await
                    });
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            },
            Some(joined) = readers.join_next(), if !readers.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Request reader panicked");
                    }
                }
            }
        }
    }

    drop(listener);
    tracing::debug!(in_flight = readers.len(), "Listener closed, draining readers");

    let drain = async { while readers.join_next().await.is_some() {} };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!(remaining = readers.len(), "Grace period elapsed, aborting readers");
        readers.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::router::ServiceTable;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn local_config() -> ListenerConfig {
        let mut config = ListenerConfig::default();
        config.bind_address = "127.0.0.1".to_string();
        config.port = 0;
        config.shutdown_grace_secs = 1.0;
        config
    }

    fn empty_server() -> HttpServer {
        let dispatcher = Arc::new(Dispatcher::new(ServiceTable::default()));
        HttpServer::bind(&local_config(), dispatcher, None).unwrap()
    }

    #[tokio::test]
    async fn answers_404_when_nothing_is_configured() {
        let server = empty_server();
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 404 "));
        server.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_concurrent() {
        let server = empty_server();
        let addr = server.local_addr();
        let other = server.clone();
        tokio::join!(server.close(), other.close());
        server.close().await;
        assert!(server.is_closing());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn wait_returns_after_close() {
        let server = empty_server();
        let waiter = {
            let server = server.clone();
            tokio::spawn(async move { server.wait().await })
        };
        server.close().await;
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stuck_reader_is_aborted_after_grace() {
        let server = empty_server();
        let _idle = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = std::time::Instant::now();
        server.close().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
