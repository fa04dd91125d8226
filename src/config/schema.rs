//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.
//! Service entries are not deserialized directly from the document: the
//! loader first merges `[defaults]`, templates and `names` expansion (see
//! `loader.rs`) and only then turns each entry into a [`ServiceConfig`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for a multiserve deployment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, port, TLS, limits).
    pub listener: ListenerConfig,

    /// Process supervision settings.
    pub supervisor: SupervisorConfig,

    /// Central logger settings.
    pub logger: LoggerConfig,

    /// Metrics exporter settings.
    pub metrics: MetricsConfig,

    /// Backend services in declaration order. Order matters: the first
    /// service whose prefix matches a request wins.
    #[serde(skip)]
    pub services: Vec<ServiceConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind host (e.g., "0.0.0.0").
    pub bind_address: String,

    /// Listening port. Cannot change on reconfiguration.
    pub port: u16,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrently running request readers (connection-level backpressure).
    pub max_connections: usize,

    /// Listen backlog for the shared socket.
    pub backlog: i32,

    /// Timeout for the whole header-read phase, TLS handshake included.
    pub header_timeout_secs: f64,

    /// Maximum cumulative size of a request head.
    pub max_header_bytes: usize,

    /// How long `close()` waits for in-flight readers before aborting them.
    pub shutdown_grace_secs: f64,
}

impl ListenerConfig {
    /// `bind_address:port` as a string.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.header_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_secs)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            tls: None,
            max_connections: 100,
            backlog: 1024,
            header_timeout_secs: 15.0,
            max_header_bytes: 100_000,
            shutdown_grace_secs: 10.0,
        }
    }
}

/// Client certificate verification mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// No client certificate requested.
    #[default]
    None,
    /// Client certificate requested and verified if presented.
    Optional,
    /// Handshake fails without a valid client certificate.
    Required,
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,

    /// Client certificate verification mode.
    #[serde(default)]
    pub verify: VerifyMode,

    /// CA bundle used to verify client certificates (PEM).
    #[serde(default)]
    pub ca_path: Option<PathBuf>,

    /// Accept X.509 proxy certificates. Not supported; rejected by validation.
    #[serde(default)]
    pub allow_proxies: bool,
}

/// Process supervision configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Number of worker processes sharing the listening socket.
    pub processes: usize,

    /// Interval for liveness and config-file checks.
    pub check_interval_secs: f64,

    /// Base stagger before a dead child is replaced.
    pub restart_delay_ms: u64,

    /// Upper bound of the restart stagger.
    pub max_restart_delay_ms: u64,

    /// How long children get to finish after "stop" before they are killed.
    pub stop_timeout_secs: f64,

    /// Optional file receiving the supervisor's pid.
    pub pid_file: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            processes: 1,
            check_interval_secs: 5.0,
            restart_delay_ms: 1000,
            max_restart_delay_ms: 30_000,
            stop_timeout_secs: 15.0,
            pid_file: None,
        }
    }
}

/// What a producer does when the central log channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait up to `block_timeout_ms`, then drop the record.
    #[default]
    Block,
    /// Drop the record immediately.
    Drop,
}

/// Central logger configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Log level filter (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for relative log paths.
    pub logs_dir: PathBuf,

    /// Main log file, "-" for stdout.
    pub log_file: String,

    /// Request log file, "-" for stdout.
    pub requests_file: String,

    /// Depth of the multi-producer log channel.
    pub channel_capacity: usize,

    /// Overflow policy for the log channel.
    pub overflow: OverflowPolicy,

    /// Producer wait under the `block` policy.
    pub block_timeout_ms: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            logs_dir: PathBuf::from("logs"),
            log_file: "-".to_string(),
            requests_file: "-".to_string(),
            channel_capacity: 1024,
            overflow: OverflowPolicy::Block,
            block_timeout_ms: 100,
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter (standalone mode only).
    pub enabled: bool,

    /// Exporter bind address.
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// One backend service entry, after defaults and templates are merged.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Unique service name, used in logs and as the queue identity.
    pub name: String,

    /// URI prefix (plain string prefix, not path-segment aware).
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Substituted for the matched prefix before forwarding.
    #[serde(default)]
    pub replace_prefix: Option<String>,

    /// Application factory name in the registry.
    pub app: String,

    /// Arguments handed to the factory.
    #[serde(default)]
    pub args: toml::Table,

    /// Concurrently executing requests.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Requests allowed to wait for a worker. 0 = no queueing.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-request timeout. Advisory unless `enforce_timeout` is set.
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: f64,

    /// Cancel application calls that exceed `timeout_secs`.
    #[serde(default)]
    pub enforce_timeout: bool,

    /// How long a request may wait for a free slot when the service is full.
    /// 0 = answer 503 at once.
    #[serde(default)]
    pub queue_timeout_secs: f64,

    /// Files whose modification re-runs the application factory.
    #[serde(default)]
    pub touch_reload: Vec<PathBuf>,

    /// Service log file (relative to `logs_dir`).
    #[serde(default)]
    pub log_file: Option<String>,

    /// Service request log file (relative to `logs_dir`).
    #[serde(default)]
    pub requests_file: Option<String>,

    /// Debug logging for this service.
    #[serde(default)]
    pub debug: bool,

    /// Template the entry was built from (informational).
    #[serde(default)]
    pub template: Option<String>,
}

impl ServiceConfig {
    /// A service with defaults for everything but name, prefix and app.
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            replace_prefix: None,
            app: app.into(),
            args: toml::Table::new(),
            max_workers: default_max_workers(),
            queue_capacity: default_queue_capacity(),
            timeout_secs: default_service_timeout(),
            enforce_timeout: false,
            queue_timeout_secs: 0.0,
            touch_reload: Vec::new(),
            log_file: None,
            requests_file: None,
            debug: false,
            template: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.queue_timeout_secs).unwrap_or_default()
    }
}

fn default_prefix() -> String {
    "/".to_string()
}

fn default_max_workers() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    10
}

fn default_service_timeout() -> f64 {
    10.0
}
