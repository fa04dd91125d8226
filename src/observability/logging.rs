//! Structured logging setup.
//!
//! # Responsibilities
//! - Console logging for standalone mode (fmt layer on stderr)
//! - [`ForwardLayer`]: turn every `tracing` event into a [`LogRecord`] and
//!   hand it to a sink (JSON on stdout for workers, the central logger
//!   channel for the supervisor itself)
//!
//! # Design Decisions
//! - Level comes from `[logger].level` unless `RUST_LOG` is set
//! - Events with target `requests` are request log lines and keep only
//!   their message; other events get their fields appended as `key=value`

use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

use crate::supervisor::ipc::{LogChannel, LogRecord};

/// Target used for request log lines.
pub const REQUESTS_TARGET: &str = "requests";

/// Receives forwarded records. Called synchronously from the emitting thread.
pub type RecordSink = Arc<dyn Fn(LogRecord) + Send + Sync>;

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Human-readable logs on stderr.
pub fn init_console(level: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
}

/// Route every event through `sink`.
pub fn init_forwarding(level: &str, layer: ForwardLayer) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(layer)
        .try_init()
}

/// Sink writing each record as one JSON line on stdout: the worker side of
/// the log channel.
pub fn stdout_sink() -> RecordSink {
    Arc::new(|record: LogRecord| {
        let Ok(line) = record.to_line() else { return };
        let mut out = std::io::stdout().lock();
        // Nowhere left to report a broken pipe; the supervisor notices the exit.
        let _ = out.write_all(line.as_bytes()).and_then(|_| out.flush());
    })
}

/// `tracing` layer converting events into [`LogRecord`]s.
pub struct ForwardLayer {
    default_source: String,
    sink: RecordSink,
}

impl ForwardLayer {
    /// `default_source` is used for events without a `service` field.
    pub fn new(default_source: impl Into<String>, sink: RecordSink) -> Self {
        Self {
            default_source: default_source.into(),
            sink,
        }
    }
}

/// Channel for an event.
pub fn channel_for(target: &str, level: &Level) -> LogChannel {
    if target == REQUESTS_TARGET {
        LogChannel::Requests
    } else if *level == Level::ERROR {
        LogChannel::Error
    } else if *level == Level::DEBUG || *level == Level::TRACE {
        LogChannel::Debug
    } else {
        LogChannel::Log
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    service: Option<String>,
    fields: String,
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "service" => self.service = Some(value.to_string()),
            name => {
                let _ = write!(self.fields, " {name}={value}");
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "service" => self.service = Some(format!("{value:?}").trim_matches('"').to_string()),
            name => {
                let _ = write!(self.fields, " {name}={value:?}");
            }
        }
    }
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let channel = channel_for(metadata.target(), metadata.level());
        let mut parts = vec![visitor.message];
        if channel != LogChannel::Requests && !visitor.fields.is_empty() {
            parts.push(visitor.fields.trim_start().to_string());
        }
        let source = visitor.service.unwrap_or_else(|| self.default_source.clone());
        (self.sink)(LogRecord::new(source, channel, parts));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn capture() -> (ForwardLayer, Arc<Mutex<Vec<LogRecord>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink_records = records.clone();
        let sink: RecordSink = Arc::new(move |record| sink_records.lock().unwrap().push(record));
        (ForwardLayer::new("worker-1", sink), records)
    }

    #[test]
    fn maps_channels_and_sources() {
        let (layer, records) = capture();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "requests", service = "echo", status = 200, "r1 GET / -> echo / 200 5");
            tracing::error!(error = "bad", "Load failed");
            tracing::debug!("details");
            tracing::warn!(service = "files", "careful");
        });

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 4);

        assert_eq!(records[0].channel, LogChannel::Requests);
        assert_eq!(records[0].source, "echo");
        assert_eq!(records[0].parts, vec!["r1 GET / -> echo / 200 5".to_string()]);

        assert_eq!(records[1].channel, LogChannel::Error);
        assert_eq!(records[1].source, "worker-1");
        assert_eq!(records[1].parts, vec!["Load failed".to_string(), "error=bad".to_string()]);

        assert_eq!(records[2].channel, LogChannel::Debug);
        assert_eq!(records[3].channel, LogChannel::Log);
        assert_eq!(records[3].source, "files");
    }

    #[test]
    fn channel_mapping() {
        assert_eq!(channel_for("requests", &Level::ERROR), LogChannel::Requests);
        assert_eq!(channel_for("multiserve::x", &Level::ERROR), LogChannel::Error);
        assert_eq!(channel_for("multiserve::x", &Level::TRACE), LogChannel::Debug);
        assert_eq!(channel_for("multiserve::x", &Level::INFO), LogChannel::Log);
        assert_eq!(channel_for("multiserve::x", &Level::WARN), LogChannel::Log);
    }
}
