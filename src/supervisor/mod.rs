//! Multi-process fan-out.
//!
//! # Data Flow
//! ```text
//! supervisor (master.rs)
//!     → binds the shared socket
//!     → spawns N workers (process.rs): `multiserve worker <config> --listen-fd <fd>`
//!     → control lines on each worker's stdin (ipc.rs)
//! workers
//!     → accept on the inherited socket, kernel picks which one
//!     → log records as JSON lines on stdout (ipc.rs)
//!     → central logger in the supervisor
//! ```

pub mod ipc;
#[cfg(unix)]
pub mod master;
#[cfg(unix)]
pub mod process;

pub use ipc::{ControlMessage, IpcError, LogChannel, LogRecord};
#[cfg(unix)]
pub use master::{ProcessSupervisor, SupervisorError, SupervisorOptions};
#[cfg(unix)]
pub use process::{ProcessRecord, WorkerCommand};
