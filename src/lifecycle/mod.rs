//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Registry + TLS + Dispatcher → Start server
//!
//! Running (startup.rs):
//!     mtime poll / notify / SIGHUP / "reconfigure" → reload → table swap
//!
//! Shutdown (shutdown.rs):
//!     SIGINT/SIGTERM / "stop" / control EOF → stop accepting → drain → exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then services, then the listener
//! - Ordered shutdown: stop accept, drain readers, drain service queues
//! - Reader shutdown has a grace period; readers still running are aborted

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::{SignalEvent, Signals};
pub use startup::{RunOptions, ServerError, Worker};
