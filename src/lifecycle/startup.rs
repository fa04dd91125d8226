//! Startup orchestration and the worker runtime.
//!
//! # Responsibilities
//! - Build the registry-backed dispatcher, TLS terminator and server from a
//!   loaded configuration
//! - Keep the process in sync with its configuration file while it runs
//! - Stop on a signal, a `stop` control message, or when the control
//!   channel closes (the supervisor went away)
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal, reload errors are not
//! - The listening address is fixed for the life of the process; a
//!   reconfiguration that changes it is refused and logged
//! - Reload triggers all funnel into [`Worker::reload`]: mtime poll,
//!   filesystem events, SIGHUP and `reconfigure` messages

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use crate::config::watcher::{ConfigWatcher, FileStamp};
use crate::config::{load_config, ConfigError, ServerConfig};
use crate::http::HttpServer;
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::lifecycle::signals::{SignalEvent, Signals};
use crate::net::{ListenerError, TlsError, TlsTerminator};
use crate::routing::Dispatcher;
use crate::service::{AppRegistry, LoadError};
use crate::supervisor::ipc::ControlMessage;

/// Fatal startup failure.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("TLS: {0}")]
    Tls(#[from] TlsError),
    #[error("backend: {0}")]
    Load(#[from] LoadError),
    #[error("listener: {0}")]
    Listener(#[from] ListenerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which reload and stop triggers [`Worker::run`] listens to.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// SIGINT/SIGTERM stop, SIGHUP reloads.
    pub signals: bool,
    /// Filesystem events on the config file trigger an early check.
    pub watch_config: bool,
    /// Read control messages from stdin; EOF means stop.
    pub control_stdin: bool,
}

/// One serving process: server, dispatcher and the configuration they came from.
pub struct Worker {
    config_path: PathBuf,
    config: ServerConfig,
    config_stamp: FileStamp,
    registry: AppRegistry,
    dispatcher: Arc<Dispatcher>,
    server: HttpServer,
}

impl Worker {
    /// Build everything and start accepting.
    ///
    /// `listener` is a socket inherited from a supervisor; without one the
    /// worker binds `[listener]` itself.
    pub fn start(
        config_path: &Path,
        config: ServerConfig,
        registry: AppRegistry,
        listener: Option<std::net::TcpListener>,
    ) -> Result<Self, ServerError> {
        let tls = config
            .listener
            .tls
            .as_ref()
            .map(TlsTerminator::from_config)
            .transpose()?;
        let dispatcher = Arc::new(Dispatcher::from_config(&config.services, &registry)?);

        let server = match listener {
            Some(listener) => HttpServer::from_std(listener, &config.listener, dispatcher.clone(), tls)?,
            None => HttpServer::bind(&config.listener, dispatcher.clone(), tls)?,
        };

        tracing::info!(
            address = %server.local_addr(),
            services = config.services.len(),
            "Worker started"
        );

        Ok(Self {
            config_path: config_path.to_path_buf(),
            config_stamp: FileStamp::new(config_path),
            config,
            registry,
            dispatcher,
            server,
        })
    }

    /// Load the configuration file and start.
    pub fn from_file(
        config_path: &Path,
        registry: AppRegistry,
        listener: Option<std::net::TcpListener>,
    ) -> Result<Self, ServerError> {
        let config = load_config(config_path)?;
        Self::start(config_path, config, registry, listener)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn server(&self) -> &HttpServer {
        &self.server
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Re-read the configuration file and swap the service table.
    /// Returns `true` if a new table was published.
    pub fn reload(&mut self) -> bool {
        self.config_stamp.refresh();
        let new_config = match load_config(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = ?self.config_path, error = %e, "Reload failed, keeping current configuration");
                return false;
            }
        };

        let old = &self.config.listener;
        let new = &new_config.listener;
        if old.port != new.port || old.bind_address != new.bind_address {
            tracing::warn!(
                current = %old.socket_address(),
                requested = %new.socket_address(),
                "Listening address cannot change on reload, keeping current"
            );
        }
        if old.tls != new.tls {
            tracing::warn!("TLS settings changed; they take effect on restart");
        }

        match self.dispatcher.reconfigure(&new_config.services, &self.registry) {
            Ok(version) => {
                tracing::info!(version, services = new_config.services.len(), "Configuration reloaded");
                let listener = self.config.listener.clone();
                self.config = new_config;
                self.config.listener = listener;
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Reload failed, keeping current services");
                false
            }
        }
    }

    /// Periodic check: config file mtime, then each service's `touch_reload` files.
    pub fn check(&mut self) {
        if self.config_stamp.changed() {
            tracing::info!(path = ?self.config_path, "Configuration file changed");
            self.reload();
        }
        let reloaded = self.dispatcher.reload_services(&self.registry);
        if reloaded > 0 {
            tracing::debug!(reloaded, "Services hot-reloaded");
        }
    }

    /// Serve until a stop trigger fires, then shut down in order.
    pub async fn run(mut self, options: RunOptions, mut stop: ShutdownSignal) -> Result<(), ServerError> {
        let mut signals = if options.signals { Some(Signals::install()?) } else { None };

        let mut nudges = None;
        let _watcher = if options.watch_config {
            let (watcher, rx) = ConfigWatcher::new(&self.config_path);
            nudges = Some(rx);
            match watcher.run() {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, relying on polling");
                    None
                }
            }
        } else {
            None
        };

        let mut control = options.control_stdin.then(spawn_control_reader);

        let mut ticker = tokio::time::interval(self.config.supervisor.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = ticker.tick() => self.check(),
                Some(()) = recv_optional(&mut nudges) => {
                    if self.config_stamp.changed() {
                        self.reload();
                    }
                }
                event = next_signal(&mut signals) => match event {
                    SignalEvent::Stop => break,
                    SignalEvent::Reload => {
                        self.reload();
                    }
                },
                message = recv_optional(&mut control) => match message {
                    Some(ControlMessage::Stop) => {
                        tracing::info!("Stop requested");
                        break;
                    }
                    Some(ControlMessage::Reconfigure) => {
                        self.reload();
                    }
                    None => {
                        tracing::info!("Control channel closed, stopping");
                        break;
                    }
                },
            }
        }

        self.server.close().await;
        tracing::info!("Worker stopped");
        Ok(())
    }
}

/// Read control messages from stdin until EOF.
fn spawn_control_reader() -> mpsc::UnboundedReceiver<ControlMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match ControlMessage::parse(&line) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring control line"),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Control channel read failed");
                    break;
                }
            }
        }
    });
    rx
}

async fn recv_optional<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_signal(signals: &mut Option<Signals>) -> SignalEvent {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}
