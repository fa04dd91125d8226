//! Central log writer for the supervisor.
//!
//! # Responsibilities
//! - Collect [`LogRecord`]s from every worker (and the supervisor itself)
//!   over one bounded MPSC channel
//! - Write them to the main log, the requests log, or the files of the
//!   service named by the record's source
//! - Re-target files when the configuration changes
//!
//! # Data Flow
//! ```text
//! worker stdout reader ─┐
//! worker stdout reader ─┼─→ LoggerHandle::log ─→ [bounded channel] ─→ consumer task ─→ files / stdout
//! supervisor ForwardLayer ┘
//! ```
//!
//! # Design Decisions
//! - Overflow policy is configurable: `block` waits up to `block_timeout_ms`
//!   and then drops, `drop` never waits. Dropped records are counted
//! - A file that cannot be opened or written falls back to stderr; the
//!   logger itself never fails
//! - Records from one producer stay in order; nothing is promised across
//!   producers

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{LoggerConfig, OverflowPolicy, ServiceConfig};
use crate::supervisor::ipc::{LogChannel, LogRecord};

/// Where a stream of log lines goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogTarget {
    Stdout,
    File(PathBuf),
}

impl LogTarget {
    /// `-` is stdout; relative paths live under `logs_dir`.
    pub fn resolve(path: &str, logs_dir: &Path) -> Self {
        if path == "-" {
            LogTarget::Stdout
        } else if Path::new(path).is_absolute() {
            LogTarget::File(PathBuf::from(path))
        } else {
            LogTarget::File(logs_dir.join(path))
        }
    }
}

/// Command-line overrides applied to every service.
#[derive(Debug, Clone, Default)]
pub struct LogOverrides {
    pub log_file: Option<String>,
    pub requests_file: Option<String>,
    pub debug: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLogs {
    pub log: LogTarget,
    pub requests: LogTarget,
    pub debug: bool,
}

/// Resolved file layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLayout {
    pub log: LogTarget,
    pub requests: LogTarget,
    pub debug: bool,
    pub services: BTreeMap<String, ServiceLogs>,
}

impl LogLayout {
    pub fn from_config(logger: &LoggerConfig, services: &[ServiceConfig], overrides: &LogOverrides) -> Self {
        let logs_dir = logger.logs_dir.as_path();
        let log = LogTarget::resolve(overrides.log_file.as_deref().unwrap_or(&logger.log_file), logs_dir);
        let requests = LogTarget::resolve(
            overrides.requests_file.as_deref().unwrap_or(&logger.requests_file),
            logs_dir,
        );
        let debug = overrides.debug.unwrap_or(false);

        let services = services
            .iter()
            .map(|service| {
                let pick = |forced: &Option<String>, own: &Option<String>, fallback: &LogTarget| match (forced, own) {
                    (Some(path), _) | (None, Some(path)) => LogTarget::resolve(path, logs_dir),
                    (None, None) => fallback.clone(),
                };
                let logs = ServiceLogs {
                    log: pick(&overrides.log_file, &service.log_file, &log),
                    requests: pick(&overrides.requests_file, &service.requests_file, &requests),
                    debug: overrides.debug.unwrap_or(service.debug),
                };
                (service.name.clone(), logs)
            })
            .collect();

        Self {
            log,
            requests,
            debug,
            services,
        }
    }

    /// Where a record goes, or `None` when its debug channel is off.
    pub fn target_for(&self, record: &LogRecord) -> Option<&LogTarget> {
        let service = self.services.get(&record.source);
        let debug = service.map(|s| s.debug).unwrap_or(self.debug);
        match record.channel {
            LogChannel::Debug if !debug => None,
            LogChannel::Requests => Some(service.map(|s| &s.requests).unwrap_or(&self.requests)),
            _ => Some(service.map(|s| &s.log).unwrap_or(&self.log)),
        }
    }
}

enum Command {
    Record(LogRecord),
    Reconfigure(LogLayout),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Producer side of the central logger. Cheap to clone.
#[derive(Clone)]
pub struct LoggerHandle {
    tx: mpsc::Sender<Command>,
    overflow: OverflowPolicy,
    block_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl LoggerHandle {
    /// Queue a record according to the overflow policy. Returns `false` if
    /// it was dropped.
    pub async fn log(&self, record: LogRecord) -> bool {
        let queued = match self.overflow {
            OverflowPolicy::Drop => self.tx.try_send(Command::Record(record)).is_ok(),
            OverflowPolicy::Block => matches!(
                tokio::time::timeout(self.block_timeout, self.tx.send(Command::Record(record))).await,
                Ok(Ok(()))
            ),
        };
        if !queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queued
    }

    /// Queue without waiting, whatever the policy. Used from synchronous code.
    pub fn try_log(&self, record: LogRecord) -> bool {
        let queued = self.tx.try_send(Command::Record(record)).is_ok();
        if !queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queued
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The single consumer plus a handle to feed it.
pub struct CentralLogger {
    handle: LoggerHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CentralLogger {
    /// Spawn the consumer task. Must be called within a Tokio runtime.
    pub fn start(config: &LoggerConfig, layout: LogLayout) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let task = tokio::spawn(consume(rx, layout));
        Self {
            handle: LoggerHandle {
                tx,
                overflow: config.overflow,
                block_timeout: Duration::from_millis(config.block_timeout_ms),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            task: Mutex::new(Some(task)),
        }
    }

    pub fn handle(&self) -> LoggerHandle {
        self.handle.clone()
    }

    pub fn dropped(&self) -> u64 {
        self.handle.dropped()
    }

    /// Switch to a new layout. Records already queued go to the old files.
    pub async fn reconfigure(&self, layout: LogLayout) {
        if self.handle.tx.send(Command::Reconfigure(layout)).await.is_err() {
            tracing::warn!("Central logger is gone, reconfigure ignored");
        }
    }

    /// Wait until everything queued so far is written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        if self.handle.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Flush and stop the consumer. Later records are dropped.
    pub async fn close(&self) {
        self.flush().await;
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

struct Writers {
    layout: LogLayout,
    files: HashMap<PathBuf, File>,
}

impl Writers {
    async fn write(&mut self, record: &LogRecord) {
        let Some(target) = self.layout.target_for(record).cloned() else {
            return;
        };
        let line = record.format_line();
        match target {
            LogTarget::Stdout => {
                let mut out = tokio::io::stdout();
                if out.write_all(line.as_bytes()).await.is_err() {
                    fallback(&line).await;
                }
            }
            LogTarget::File(path) => {
                if let Err(e) = self.write_file(&path, line.as_bytes()).await {
                    self.files.remove(&path);
                    fallback(&format!("cannot write {}: {e}\n", path.display())).await;
                    fallback(&line).await;
                }
            }
        }
    }

    async fn write_file(&mut self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if !self.files.contains_key(path) {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir).await?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path).await?;
            self.files.insert(path.to_path_buf(), file);
        }
        match self.files.get_mut(path) {
            Some(file) => file.write_all(bytes).await,
            None => Ok(()),
        }
    }

    async fn flush(&mut self) {
        for file in self.files.values_mut() {
            let _ = file.flush().await;
        }
        let _ = tokio::io::stdout().flush().await;
    }
}

async fn fallback(line: &str) {
    let _ = tokio::io::stderr().write_all(line.as_bytes()).await;
}

async fn consume(mut rx: mpsc::Receiver<Command>, layout: LogLayout) {
    let mut writers = Writers {
        layout,
        files: HashMap::new(),
    };
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(record) => writers.write(&record).await,
            Command::Reconfigure(layout) => {
                writers.flush().await;
                writers.files.clear();
                writers.layout = layout;
            }
            Command::Flush(done) => {
                writers.flush().await;
                let _ = done.send(());
            }
        }
    }
    writers.flush().await;
}
