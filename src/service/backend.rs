//! Backend services: one named application behind a bounded worker pool.
//!
//! # Responsibilities
//! - Admission control: at most `max_workers + queue_capacity` requests are
//!   running or waiting at any time; the rest wait up to `queue_timeout_secs`
//!   for a slot, then are refused
//! - Strict FIFO hand-off from the queue to exactly `max_workers` workers
//! - Run the application, turning errors and panics into a 500 or an abort
//! - Hot reload: re-run the factory when a `touch_reload` file changes
//! - Emit the per-request log line
//!
//! # Design Decisions
//! - `accept` never blocks; `admit` is the waiting variant the dispatcher uses
//! - A worker owns the connection while it runs; the service only counts it
//! - The application handle lives in an `ArcSwap`, so a reload never
//!   disturbs requests already holding the old handle

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::watcher::FileStamp;
use crate::config::ServiceConfig;
use crate::http::body::BodyReader;
use crate::http::environ::Environ;
use crate::http::response::ResponseWriter;
use crate::net::connection::ConnectionRecord;
use crate::observability::metrics;
use crate::routing::matcher::PrefixRule;
use crate::service::app::{AppError, Request};
use crate::service::registry::{AppRegistry, AppSpec, BackendHandle, LoadError};

/// Outcome of offering a connection to a service.
#[derive(Debug)]
pub enum Admission {
    /// Queued or running; the service owns the connection now.
    Accepted,
    /// Queue full or service closed. The connection is handed back.
    Unavailable(ConnectionRecord),
}

/// One admitted request waiting for a worker.
struct WorkItem {
    conn: ConnectionRecord,
    enqueued_at: Instant,
    _slot: SlotGuard,
}

/// Holds one admission slot; released on drop, whatever happens to the
/// request.
struct SlotGuard {
    load: Arc<AtomicUsize>,
    released: Arc<Notify>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.load.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_waiters();
    }
}

/// State shared between the service handle and its workers.
struct Shared {
    name: String,
    config: ServiceConfig,
    handle: ArcSwap<BackendHandle>,
    running: AtomicUsize,
}

/// A named, prefix-matched backend with its own worker pool.
pub struct BackendService {
    shared: Arc<Shared>,
    rule: PrefixRule,
    spec: AppSpec,
    stamps: Mutex<Vec<FileStamp>>,
    load: Arc<AtomicUsize>,
    released: Arc<Notify>,
    capacity: usize,
    queue: Mutex<Option<mpsc::UnboundedSender<WorkItem>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BackendService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendService")
            .field("name", &self.shared.name)
            .field("prefix", &self.rule.prefix())
            .field("load", &self.load())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl BackendService {
    /// Load the application and start `max_workers` workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: ServiceConfig, registry: &AppRegistry) -> Result<Arc<Self>, LoadError> {
        let spec = AppSpec::from_service(&config);
        let handle = registry.load(&spec)?;
        Ok(Self::with_handle(config, spec, handle))
    }

    /// Start a service around an already loaded handle.
    pub fn with_handle(config: ServiceConfig, spec: AppSpec, handle: BackendHandle) -> Arc<Self> {
        let workers_count = config.max_workers.max(1);
        let capacity = workers_count + config.queue_capacity;
        let stamps = config.touch_reload.iter().map(|p| FileStamp::new(p.clone())).collect();
        let rule = PrefixRule::new(config.prefix.clone(), config.replace_prefix.clone());

        let shared = Arc::new(Shared {
            name: config.name.clone(),
            config,
            handle: ArcSwap::from_pointee(handle),
            running: AtomicUsize::new(0),
        });

        let (tx, rx) = mpsc::unbounded_channel::<WorkItem>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..workers_count)
            .map(|_| {
                let shared = shared.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        // One worker at a time waits on the queue, which keeps
                        // hand-off in arrival order.
                        let item = { rx.lock().await.recv().await };
                        let Some(item) = item else { break };
                        shared.process(item).await;
                    }
                })
            })
            .collect();

        tracing::info!(
            service = %shared.name,
            prefix = %rule.prefix(),
            max_workers = workers_count,
            queue_capacity = shared.config.queue_capacity,
            "Service started"
        );

        Arc::new(Self {
            shared,
            rule,
            spec,
            stamps: Mutex::new(stamps),
            load: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(Notify::new()),
            capacity,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.shared.config
    }

    pub fn rule(&self) -> &PrefixRule {
        &self.rule
    }

    /// Requests running or queued right now.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    /// Requests currently inside application code.
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }

    /// The handle new requests will use.
    pub fn current_handle(&self) -> Arc<BackendHandle> {
        self.shared.handle.load_full()
    }

    /// Reserve an admission slot if one is free.
    fn try_acquire_slot(&self) -> Option<SlotGuard> {
        let mut prev = self.load.load(Ordering::Acquire);
        loop {
            if prev >= self.capacity {
                return None;
            }
            match self
                .load
                .compare_exchange_weak(prev, prev + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(SlotGuard {
            load: self.load.clone(),
            released: self.released.clone(),
        })
    }

    /// Queue a connection for this service without blocking.
    pub fn accept(&self, mut conn: ConnectionRecord) -> Admission {
        let Some(slot) = self.try_acquire_slot() else {
            return Admission::Unavailable(conn);
        };
        conn.service_name = Some(self.shared.name.clone());

        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = queue.as_ref() else {
            return Admission::Unavailable(conn);
        };
        let item = WorkItem {
            conn,
            enqueued_at: Instant::now(),
            _slot: slot,
        };
        match tx.send(item) {
            Ok(()) => Admission::Accepted,
            Err(mpsc::error::SendError(item)) => Admission::Unavailable(item.conn),
        }
    }

    /// Like [`accept`](Self::accept), but a full service is given up to
    /// `queue_timeout_secs` to free a slot before the connection is handed
    /// back.
    pub async fn admit(&self, conn: ConnectionRecord) -> Admission {
        let wait = self.shared.config.queue_timeout();
        let mut conn = match self.accept(conn) {
            Admission::Unavailable(conn) if !wait.is_zero() && !self.is_closed() => conn,
            admission => return admission,
        };

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before retrying so a release in between is not missed.
            released.as_mut().enable();

            conn = match self.accept(conn) {
                Admission::Unavailable(conn) => conn,
                accepted => return accepted,
            };
            if self.is_closed() || tokio::time::timeout_at(deadline, released).await.is_err() {
                tracing::debug!(
                    service = %self.shared.name,
                    request_id = %conn.id,
                    waited = ?wait,
                    "No slot freed in time"
                );
                return Admission::Unavailable(conn);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Re-run the factory if any `touch_reload` file changed since the last
    /// load. A failed reload keeps the current application.
    ///
    /// Returns true if a new handle was published.
    pub fn reload_if_needed(&self, registry: &AppRegistry) -> bool {
        let mut stamps = self.stamps.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(changed) = stamps.iter().find(|s| s.changed()) else {
            return false;
        };
        tracing::info!(service = %self.shared.name, path = ?changed.path(), "Reload triggered");
        for stamp in stamps.iter_mut() {
            stamp.refresh();
        }
        drop(stamps);

        match registry.load(&self.spec) {
            Ok(handle) => {
                self.shared.handle.store(Arc::new(handle));
                tracing::info!(service = %self.shared.name, "Application reloaded");
                true
            }
            Err(e) => {
                tracing::error!(
                    service = %self.shared.name,
                    error = %e,
                    "Reload failed, keeping previous application"
                );
                false
            }
        }
    }

    /// Stop taking work and wait for queued and running requests to finish.
    pub async fn close(&self) {
        let sender = self.queue.lock().unwrap_or_else(PoisonError::into_inner).take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        self.released.notify_waiters();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(service = %self.shared.name, error = %e, "Worker task failed");
            }
        }
        tracing::debug!(service = %self.shared.name, "Service closed");
    }
}

impl Drop for BackendService {
    fn drop(&mut self) {
        // Workers exit once the queue sender is gone.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// How the application call ended.
enum Outcome {
    Completed,
    Failed(AppError),
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Shared {
    /// Run one request to completion. The connection is closed on every path.
    async fn process(&self, item: WorkItem) {
        let WorkItem {
            mut conn,
            enqueued_at,
            _slot: slot,
        } = item;
        let started = Instant::now();
        let handle = self.handle.load_full();
        conn.script_filename = handle.source();

        let environ = Environ::from_connection(&conn);
        let Some(stream) = conn.take_stream() else {
            tracing::warn!(service = %self.name, request_id = %conn.id, "Connection gone before processing");
            return;
        };
        let (read_half, write_half) = tokio::io::split(stream);
        let body = BodyReader::new(
            std::mem::take(&mut conn.body_prefix),
            Box::new(read_half),
            environ.content_length(),
        );
        let mut writer = ResponseWriter::new(Box::new(write_half), conn.id.to_string());

        let running = self.running.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_active_workers(&self.name, running);

        if environ.expects_continue() {
            if let Err(e) = writer.send_continue().await {
                tracing::debug!(request_id = %conn.id, error = %e, "Failed to send 100 Continue");
            }
        }

        let request = Request { environ, body };
        let call = AssertUnwindSafe(handle.app().call(request, &mut writer)).catch_unwind();
        let result = if self.config.enforce_timeout {
            match tokio::time::timeout(self.config.timeout(), call).await {
                Ok(result) => result,
                Err(_) => Ok(Err(AppError::Timeout(self.config.timeout()))),
            }
        } else {
            call.await
        };
        let outcome = match result {
            Ok(Ok(())) => Outcome::Completed,
            Ok(Err(e)) => Outcome::Failed(e),
            Err(payload) => Outcome::Failed(AppError::Panic(panic_message(payload))),
        };

        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::set_active_workers(&self.name, running);
        // The slot must be free before the client sees EOF, or an immediate
        // follow-up request could find the service still full.
        drop(slot);

        let outcome = match outcome {
            Outcome::Completed if !writer.is_started() => {
                Outcome::Failed(AppError::msg("application did not start a response"))
            }
            other => other,
        };

        match outcome {
            Outcome::Completed => {
                if let Err(e) = writer.finish().await {
                    tracing::debug!(request_id = %conn.id, error = %e, "Error finishing response");
                }
            }
            Outcome::Failed(e) => {
                tracing::error!(
                    service = %self.name,
                    request_id = %conn.id,
                    error = %e,
                    "Request failed"
                );
                if writer.is_committed() {
                    writer.abort();
                } else {
                    let body = format!("Error in application: {e}");
                    match writer.send_error(500, "Internal Server Error", &body).await {
                        Ok(()) => {
                            if let Err(e) = writer.finish().await {
                                tracing::debug!(request_id = %conn.id, error = %e, "Error finishing response");
                            }
                        }
                        Err(e) => {
                            tracing::debug!(request_id = %conn.id, error = %e, "Failed to send 500");
                            writer.abort();
                        }
                    }
                }
            }
        }

        let status = writer.status().unwrap_or(0);
        metrics::record_request(&self.name, status, started);
        tracing::info!(
            target: "requests",
            service = %self.name,
            request_id = %conn.id,
            status,
            bytes = writer.bytes_written(),
            queued_ms = started.duration_since(enqueued_at).as_millis() as u64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "{} {}:{} :{} {} {} -> {} {} {} {}",
            conn.id,
            conn.client_addr.ip(),
            conn.client_addr.port(),
            conn.server_port,
            conn.head.method().unwrap_or("-"),
            conn.head.original_uri().unwrap_or("-"),
            self.name,
            conn.head.path(),
            status,
            writer.bytes_written(),
        );
        conn.close().await;
    }
}
