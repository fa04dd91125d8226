//! The process supervisor.
//!
//! # Responsibilities
//! - Bind the shared listening socket once and hand it to every worker
//! - Keep `[supervisor].processes` workers alive, restarting dead ones with
//!   a backoff stagger
//! - Poll the configuration file; on change tell every worker to
//!   reconfigure, grow or shrink the fleet and re-target log files
//! - Stop the fleet gracefully on SIGINT/SIGTERM
//!
//! # Data Flow
//! ```text
//! check tick ──→ config mtime changed? ──→ reconfigure() ──→ "reconfigure" to each worker
//!            └─→ check_children() ──→ dead? ──→ schedule restart after backoff
//! restart due ─→ respawn one ──→ more pending? ──→ schedule the next
//! SIGHUP ─────→ reconfigure()
//! SIGINT/TERM ─→ "stop" to each worker ──→ wait stop_timeout ──→ kill leftovers
//! ```
//!
//! # Design Decisions
//! - The kernel distributes connections between workers; the supervisor
//!   never touches client traffic
//! - A child death never propagates: it is logged, counted and replaced
//! - Restart delays are deadlines in the main `select!`, never sleeps, so a
//!   crash-looping fleet still stops promptly
//! - The listening address cannot change while running; such a
//!   reconfiguration is logged and the rest of it still applies

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::watcher::FileStamp;
use crate::config::{load_config, ConfigError, ServerConfig};
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::lifecycle::signals::{SignalEvent, Signals};
use crate::net::listener::{bind_shared, ListenerError};
use crate::observability::central::{CentralLogger, LogLayout, LogOverrides};
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::supervisor::process::{ProcessRecord, WorkerCommand};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("listener: {0}")]
    Listener(#[from] ListenerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the supervisor needs besides the configuration itself.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub config_path: PathBuf,
    pub overrides: LogOverrides,
    /// Listen for SIGINT/SIGTERM/SIGHUP.
    pub signals: bool,
    /// Override the worker binary (defaults to the running executable).
    pub worker_program: Option<PathBuf>,
}

pub struct ProcessSupervisor {
    options: SupervisorOptions,
    config: ServerConfig,
    config_stamp: FileStamp,
    version: u64,
    listener: std::net::TcpListener,
    command: WorkerCommand,
    children: Vec<ProcessRecord>,
    logger: Arc<CentralLogger>,
    restart_attempt: u32,
    pending_restarts: usize,
    next_restart_at: Option<Instant>,
}

/// How long a dead worker's last stdout lines may take to reach the logger.
const DEAD_WORKER_LOG_DRAIN: Duration = Duration::from_secs(1);

impl ProcessSupervisor {
    /// Bind the shared socket. No worker is started until [`run`](Self::run).
    pub fn new(
        options: SupervisorOptions,
        config: ServerConfig,
        logger: Arc<CentralLogger>,
    ) -> Result<Self, SupervisorError> {
        let listener = bind_shared(&config.listener.socket_address(), config.listener.backlog)?;
        let mut command = WorkerCommand::current_exe(&options.config_path, listener.as_raw_fd())?;
        if let Some(program) = &options.worker_program {
            command.program = program.clone();
        }

        tracing::info!(
            address = %config.listener.socket_address(),
            processes = config.supervisor.processes,
            "Supervisor ready"
        );

        Ok(Self {
            config_stamp: FileStamp::new(&options.config_path),
            options,
            config,
            version: 1,
            listener,
            command,
            children: Vec::new(),
            logger,
            restart_attempt: 0,
            pending_restarts: 0,
            next_restart_at: None,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config_path(&self) -> &Path {
        &self.options.config_path
    }

    pub fn pids(&self) -> Vec<u32> {
        self.children.iter().map(ProcessRecord::pid).collect()
    }

    fn spawn_one(&mut self) {
        match ProcessRecord::spawn(&self.command, self.logger.handle(), self.version) {
            Ok(child) => self.children.push(child),
            Err(e) => tracing::error!(error = %e, "Failed to spawn worker"),
        }
    }

    /// Start workers until the configured count is reached.
    pub fn spawn_missing(&mut self) {
        let wanted = self.config.supervisor.processes;
        while self.children.len() < wanted {
            let before = self.children.len();
            self.spawn_one();
            if self.children.len() == before {
                break;
            }
        }
    }

    /// Reap dead workers and schedule their replacements. Returns how many
    /// died since the last check.
    pub fn check_children(&mut self) -> usize {
        let mut died = 0usize;
        let mut alive = Vec::with_capacity(self.children.len());
        for mut child in self.children.drain(..) {
            match child.try_status() {
                Ok(None) => {
                    alive.push(child);
                    continue;
                }
                Ok(Some(status)) => {
                    tracing::error!(pid = child.pid(), status = %status, uptime = ?child.uptime(), "Worker died");
                }
                Err(e) => {
                    tracing::error!(pid = child.pid(), error = %e, "Cannot query worker status, replacing it");
                }
            }
            died += 1;
            tokio::spawn(child.collect_logs(DEAD_WORKER_LOG_DRAIN));
        }
        self.children = alive;

        if died == 0 {
            // Only a fleet that outlived the longest backoff counts as recovered.
            let settled = Duration::from_millis(self.config.supervisor.max_restart_delay_ms);
            if self.pending_restarts == 0 && self.children.iter().all(|c| c.uptime() >= settled) {
                self.restart_attempt = 0;
            }
            return 0;
        }
        self.pending_restarts += died;
        if self.next_restart_at.is_none() {
            self.schedule_restart();
        }
        died
    }

    /// Workers waiting for their restart deadline.
    pub fn pending_restarts(&self) -> usize {
        self.pending_restarts
    }

    fn schedule_restart(&mut self) {
        self.restart_attempt = self.restart_attempt.saturating_add(1);
        let delay = calculate_backoff(
            self.restart_attempt,
            self.config.supervisor.restart_delay_ms,
            self.config.supervisor.max_restart_delay_ms,
        );
        tracing::info!(attempt = self.restart_attempt, delay = ?delay, "Worker restart scheduled");
        self.next_restart_at = Some(Instant::now() + delay);
    }

    /// Start one pending replacement and schedule the next, if any.
    fn restart_due(&mut self) {
        self.next_restart_at = None;
        if self.pending_restarts == 0 {
            return;
        }
        self.pending_restarts -= 1;
        if self.children.len() < self.config.supervisor.processes {
            metrics::record_child_restart();
            self.spawn_one();
        }
        if self.pending_restarts > 0 {
            self.schedule_restart();
        }
    }

    /// Re-read the configuration and apply it to the fleet and the logger.
    pub async fn reconfigure(&mut self) -> bool {
        self.config_stamp.refresh();
        let new_config = match load_config(&self.options.config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Reconfigure failed, keeping current configuration");
                return false;
            }
        };
        if new_config.listener.socket_address() != self.config.listener.socket_address() {
            tracing::error!(
                current = %self.config.listener.socket_address(),
                requested = %new_config.listener.socket_address(),
                "Listening address cannot change while running, keeping current"
            );
        }

        let listener = self.config.listener.clone();
        self.config = new_config;
        self.config.listener = listener;
        self.version += 1;

        self.logger
            .reconfigure(LogLayout::from_config(
                &self.config.logger,
                &self.config.services,
                &self.options.overrides,
            ))
            .await;

        let wanted = self.config.supervisor.processes;
        while self.children.len() > wanted {
            if let Some(child) = self.children.pop() {
                child.stop(self.config.supervisor.stop_timeout()).await;
            }
        }
        let version = self.version;
        for child in &mut self.children {
            child.reconfigure(version).await;
        }
        self.spawn_missing();
        // Replacements already started by the resize need no restart.
        let missing = wanted.saturating_sub(self.children.len());
        self.pending_restarts = self.pending_restarts.min(missing);

        tracing::info!(version, processes = self.children.len(), "Supervisor reconfigured");
        true
    }

    /// Stop every worker in parallel, each with the configured timeout.
    pub async fn stop_all(&mut self) {
        let timeout = self.config.supervisor.stop_timeout();
        let stops: Vec<_> = self
            .children
            .drain(..)
            .map(|child| tokio::spawn(child.stop(timeout)))
            .collect();
        for stop in stops {
            if let Err(e) = stop.await {
                tracing::warn!(error = %e, "Worker stop task failed");
            }
        }
    }

    /// Supervise until a stop signal arrives.
    pub async fn run(mut self, mut stop: ShutdownSignal) -> Result<(), SupervisorError> {
        let pid_file = self.config.supervisor.pid_file.clone();
        if let Some(path) = &pid_file {
            std::fs::write(path, std::process::id().to_string())?;
        }
        let mut signals = if self.options.signals { Some(Signals::install()?) } else { None };

        self.spawn_missing();

        let mut ticker = tokio::time::interval(self.config.supervisor.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = ticker.tick() => {
                    if self.config_stamp.changed() {
                        tracing::info!(path = ?self.options.config_path, "Configuration file changed");
                        self.reconfigure().await;
                    }
                    self.check_children();
                }
                _ = restart_deadline(self.next_restart_at) => self.restart_due(),
                event = next_signal(&mut signals) => match event {
                    SignalEvent::Stop => {
                        tracing::info!("Stopping workers");
                        break;
                    }
                    SignalEvent::Reload => {
                        self.reconfigure().await;
                    }
                },
            }
        }

        self.stop_all().await;
        if let Some(path) = &pid_file {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = ?path, error = %e, "Failed to remove pid file");
            }
        }
        tracing::info!("Supervisor stopped");
        self.logger.close().await;
        Ok(())
    }
}

async fn restart_deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_signal(signals: &mut Option<Signals>) -> SignalEvent {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::shutdown::Shutdown;

    /// A one-process fleet whose worker exits as soon as it starts.
    fn crashing_supervisor(restart_delay_ms: u64) -> ProcessSupervisor {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "127.0.0.1".to_string();
        config.listener.port = 0;
        config.supervisor.processes = 1;
        config.supervisor.check_interval_secs = 0.05;
        config.supervisor.restart_delay_ms = restart_delay_ms;
        config.supervisor.max_restart_delay_ms = restart_delay_ms;
        config.supervisor.stop_timeout_secs = 1.0;

        let layout = LogLayout::from_config(&config.logger, &[], &LogOverrides::default());
        let logger = Arc::new(CentralLogger::start(&config.logger, layout));
        let options = SupervisorOptions {
            config_path: PathBuf::from("/nonexistent/multiserve.toml"),
            overrides: LogOverrides::default(),
            signals: false,
            worker_program: Some(PathBuf::from("/bin/false")),
        };
        ProcessSupervisor::new(options, config, logger).unwrap()
    }

    async fn wait_for_death(supervisor: &mut ProcessSupervisor) -> usize {
        for _ in 0..200 {
            let died = supervisor.check_children();
            if died > 0 {
                return died;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never exited");
    }

    #[tokio::test]
    async fn dead_worker_is_replaced_at_its_deadline() {
        let mut supervisor = crashing_supervisor(100);
        supervisor.spawn_missing();
        assert_eq!(supervisor.pids().len(), 1);

        assert_eq!(wait_for_death(&mut supervisor).await, 1);
        assert!(supervisor.pids().is_empty());
        assert_eq!(supervisor.pending_restarts(), 1);
        let due = supervisor.next_restart_at.unwrap();
        assert!(due > Instant::now());

        tokio::time::sleep_until(due).await;
        supervisor.restart_due();
        assert_eq!(supervisor.pids().len(), 1);
        assert_eq!(supervisor.pending_restarts(), 0);
        assert!(supervisor.next_restart_at.is_none());

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn restarts_back_off_while_deaths_continue() {
        let mut supervisor = crashing_supervisor(300);
        supervisor.spawn_missing();
        wait_for_death(&mut supervisor).await;
        assert_eq!(supervisor.restart_attempt, 1);

        let due = supervisor.next_restart_at.unwrap();
        tokio::time::sleep_until(due).await;
        supervisor.restart_due();
        wait_for_death(&mut supervisor).await;
        assert_eq!(supervisor.restart_attempt, 2);

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn stop_is_not_held_up_by_a_pending_restart() {
        let supervisor = crashing_supervisor(4000);
        let shutdown = Shutdown::new();
        let running = tokio::spawn(supervisor.run(shutdown.subscribe()));

        // Long enough for the worker to die and its restart to be scheduled.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let triggered = std::time::Instant::now();
        assert!(shutdown.trigger());

        tokio::time::timeout(Duration::from_secs(3), running)
            .await
            .expect("supervisor did not stop")
            .unwrap()
            .unwrap();
        assert!(triggered.elapsed() < Duration::from_secs(1), "stop took {:?}", triggered.elapsed());
    }
}
