//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse, expand defaults/templates/names)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!
//! On reload (mtime change, notify event, SIGHUP, "reconfigure" message):
//!     loader.rs loads new config
//!     → validation.rs validates
//!     → new ServiceTable built from it
//!     → atomic swap inside the Dispatcher
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - A config that fails to load keeps the previous one in effect

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ListenerConfig, LoggerConfig, MetricsConfig, OverflowPolicy, ServerConfig, ServiceConfig,
    SupervisorConfig, TlsConfig, VerifyMode,
};
