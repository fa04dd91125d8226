//! Supervisor ↔ worker protocol.
//!
//! Newline-delimited JSON in both directions:
//! - control, supervisor → worker stdin: `{"command":"stop"}`, `{"command":"reconfigure"}`
//! - log records, worker stdout → supervisor:
//!   `{"source":"echo","channel":"requests","timestamp":1700000000.25,"parts":["..."]}`
//!
//! Anything a worker prints that is not a log record (a stray `println!`, a
//! panic message) is kept and wrapped as a `log` record.

use std::fmt;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Commands the supervisor sends to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ControlMessage {
    Stop,
    Reconfigure,
}

impl ControlMessage {
    /// One protocol line, newline included.
    pub fn to_line(self) -> Result<String, IpcError> {
        let mut line = serde_json::to_string(&self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn parse(line: &str) -> Result<Self, IpcError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Log channel of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogChannel {
    Log,
    Error,
    Debug,
    Requests,
}

impl fmt::Display for LogChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogChannel::Log => "log",
            LogChannel::Error => "error",
            LogChannel::Debug => "debug",
            LogChannel::Requests => "requests",
        })
    }
}

/// One log message travelling from a worker to the central logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub source: String,
    pub channel: LogChannel,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub parts: Vec<String>,
}

impl LogRecord {
    /// A record stamped with the current time.
    pub fn new(source: impl Into<String>, channel: LogChannel, parts: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            source: source.into(),
            channel,
            timestamp: now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6,
            parts,
        }
    }

    /// Serialize as one protocol line, newline included.
    pub fn to_line(&self) -> Result<String, IpcError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse a line read from a worker. Lines that are not records become a
    /// `log` record attributed to `fallback_source`.
    pub fn from_line(line: &str, fallback_source: &str) -> Self {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        match serde_json::from_str::<LogRecord>(trimmed) {
            Ok(record) => record,
            Err(_) => LogRecord::new(fallback_source, LogChannel::Log, vec![trimmed.to_string()]),
        }
    }

    pub fn message(&self) -> String {
        self.parts.join(" ")
    }

    /// `2024-01-02 10:11:12.345 [source] message`, with an `ERROR:` or
    /// `DEBUG:` marker on those channels.
    pub fn format_line(&self) -> String {
        let secs = self.timestamp.trunc() as i64;
        let nanos = (self.timestamp.fract() * 1e9) as u32;
        let time = DateTime::<Utc>::from_timestamp(secs, nanos)
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| format!("{:.3}", self.timestamp));
        let marker = match self.channel {
            LogChannel::Error => "ERROR: ",
            LogChannel::Debug => "DEBUG: ",
            LogChannel::Log | LogChannel::Requests => "",
        };
        format!("{time} [{}] {marker}{}\n", self.source, self.message())
    }
}
