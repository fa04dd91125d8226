//! One supervised worker process.

use std::ffi::OsString;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::observability::central::LoggerHandle;
use crate::supervisor::ipc::{ControlMessage, LogRecord};

/// How to start a worker: `<program> <prefix args> worker <config> --listen-fd <fd>`.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub prefix_args: Vec<OsString>,
    pub config_path: PathBuf,
    pub listen_fd: RawFd,
}

impl WorkerCommand {
    /// Re-execute the running binary.
    pub fn current_exe(config_path: &Path, listen_fd: RawFd) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            prefix_args: Vec::new(),
            config_path: config_path.to_path_buf(),
            listen_fd,
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix_args)
            .arg("worker")
            .arg(&self.config_path)
            .arg("--listen-fd")
            .arg(self.listen_fd.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

/// A running child plus the pipes the supervisor talks to it through.
#[derive(Debug)]
pub struct ProcessRecord {
    pid: u32,
    child: Child,
    control: Option<ChildStdin>,
    started_at: Instant,
    last_config_version: u64,
    log_forwarder: JoinHandle<()>,
}

impl ProcessRecord {
    /// Spawn a worker and start forwarding its stdout to the central logger.
    pub fn spawn(command: &WorkerCommand, logger: LoggerHandle, config_version: u64) -> std::io::Result<Self> {
        let mut child = command.command().spawn()?;
        let pid = child.id().unwrap_or_default();
        let control = child.stdin.take();
        let stdout = child.stdout.take();

        let source = format!("worker-{pid}");
        let log_forwarder = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                logger.log(LogRecord::from_line(&line, &source)).await;
            }
        });

        tracing::info!(pid, "Worker spawned");
        Ok(Self {
            pid,
            child,
            control,
            started_at: Instant::now(),
            last_config_version: config_version,
            log_forwarder,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn last_config_version(&self) -> u64 {
        self.last_config_version
    }

    /// Exit status if the child has exited, without waiting.
    pub fn try_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Write one control message to the child's stdin.
    pub async fn send(&mut self, message: ControlMessage) -> std::io::Result<()> {
        let Some(control) = self.control.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "control channel closed",
            ));
        };
        let line = message.to_line().map_err(std::io::Error::other)?;
        control.write_all(line.as_bytes()).await?;
        control.flush().await
    }

    /// Ask the child to reconfigure and remember which version it was told about.
    pub async fn reconfigure(&mut self, version: u64) {
        match self.send(ControlMessage::Reconfigure).await {
            Ok(()) => self.last_config_version = version,
            Err(e) => tracing::warn!(pid = self.pid, error = %e, "Failed to send reconfigure"),
        }
    }

    /// Graceful stop: send `stop`, close the control pipe, wait up to
    /// `timeout`, then kill.
    pub async fn stop(mut self, timeout: Duration) -> Option<ExitStatus> {
        if let Err(e) = self.send(ControlMessage::Stop).await {
            tracing::debug!(pid = self.pid, error = %e, "Stop message not delivered");
        }
        self.control = None;

        let status = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(pid = self.pid, error = %e, "Waiting for worker failed");
                None
            }
            Err(_) => {
                tracing::warn!(pid = self.pid, timeout = ?timeout, "Worker did not stop in time, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::error!(pid = self.pid, error = %e, "Failed to kill worker");
                }
                self.child.try_wait().ok().flatten()
            }
        };
        let pid = self.pid;
        self.collect_logs(Duration::from_secs(1)).await;
        tracing::info!(pid, status = ?status, "Worker stopped");
        status
    }

    /// Wait up to `timeout` for the forwarder to pass on what an exited
    /// child wrote last, then release the record.
    pub async fn collect_logs(mut self, timeout: Duration) {
        if tokio::time::timeout(timeout, &mut self.log_forwarder).await.is_err() {
            tracing::debug!(pid = self.pid, "Worker output still open, dropping the rest");
        }
    }
}

impl Drop for ProcessRecord {
    fn drop(&mut self) {
        self.log_forwarder.abort();
    }
}
