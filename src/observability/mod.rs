//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (structured fields, request id on every request line)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Standalone:  events → logging.rs fmt layer → stderr
//! Worker:      events → logging.rs ForwardLayer → JSON lines on stdout
//! Supervisor:  worker stdout + own events → central.rs → log files
//! ```
//!
//! # Design Decisions
//! - Request lines use the `requests` target so every mode can route them
//!   to a separate file
//! - Metrics are cheap (atomic increments) and no-ops without an exporter

pub mod central;
pub mod logging;
pub mod metrics;

pub use central::{CentralLogger, LogLayout, LogOverrides, LogTarget, LoggerHandle};
pub use logging::{init_console, init_forwarding, ForwardLayer, RecordSink, REQUESTS_TARGET};
