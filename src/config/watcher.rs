//! Change detection for the configuration file and hot-reload paths.
//!
//! Two mechanisms feed the same reload path:
//! - [`FileStamp`] polls modification times (used by the supervisor, the
//!   per-service `touch_reload` lists and the worker's periodic check)
//! - [`ConfigWatcher`] turns filesystem events into an early nudge so a
//!   standalone server does not wait a whole check interval

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Remembered modification time of one file.
#[derive(Debug, Clone)]
pub struct FileStamp {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl FileStamp {
    /// Record the current modification time of `path`.
    /// A missing file is recorded as `None`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let modified = mtime(&path);
        Self { path, modified }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the file exists and its mtime differs from the recorded one.
    /// A file that disappeared does not count as a change.
    pub fn changed(&self) -> bool {
        match mtime(&self.path) {
            Some(current) => Some(current) != self.modified,
            None => false,
        }
    }

    /// Re-record the current modification time.
    pub fn refresh(&mut self) {
        self.modified = mtime(&self.path);
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    nudge_tx: mpsc::UnboundedSender<()>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver that yields one `()` per
    /// modification event. Receivers still have to compare mtimes: editors
    /// emit several events per save.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                nudge_tx,
            },
            nudge_rx,
        )
    }

    /// Start watching the file in a background thread.
    /// The returned watcher must be kept alive for events to flow.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.nudge_tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::debug!("Config file change detected");
                        let _ = tx.send(());
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}
