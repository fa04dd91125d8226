//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, worker counts >= 1)
//! - Detect duplicate service names
//! - Reject TLS settings the terminator cannot honour
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system
//! - Overlapping prefixes are legal: first match wins, so ordering is the
//!   operator's responsibility

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::{ServerConfig, VerifyMode};

/// A single semantic problem in a configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener: {0}")]
    Listener(String),

    #[error("tls: {0}")]
    Tls(String),

    #[error("supervisor: {0}")]
    Supervisor(String),

    #[error("logger: {0}")]
    Logger(String),

    #[error("service `{name}`: {message}")]
    Service { name: String, message: String },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    if listener.max_connections == 0 {
        errors.push(ValidationError::Listener("max_connections must be at least 1".into()));
    }
    if listener.max_header_bytes == 0 {
        errors.push(ValidationError::Listener("max_header_bytes must be positive".into()));
    }
    if !(listener.header_timeout_secs > 0.0) {
        errors.push(ValidationError::Listener("header_timeout_secs must be positive".into()));
    }
    if listener.shutdown_grace_secs < 0.0 {
        errors.push(ValidationError::Listener("shutdown_grace_secs must not be negative".into()));
    }

    if let Some(tls) = &listener.tls {
        if tls.verify != VerifyMode::None && tls.ca_path.is_none() {
            errors.push(ValidationError::Tls(format!(
                "verify = {:?} requires ca_path",
                tls.verify
            )));
        }
        if tls.allow_proxies {
            errors.push(ValidationError::Tls(
                "X.509 proxy certificates are not supported".into(),
            ));
        }
    }

    let supervisor = &config.supervisor;
    if supervisor.processes == 0 {
        errors.push(ValidationError::Supervisor("processes must be at least 1".into()));
    }
    if !(supervisor.check_interval_secs > 0.0) {
        errors.push(ValidationError::Supervisor("check_interval_secs must be positive".into()));
    }

    if config.logger.channel_capacity == 0 {
        errors.push(ValidationError::Logger("channel_capacity must be at least 1".into()));
    }

    let mut seen = HashSet::new();
    for service in &config.services {
        let fail = |message: &str| ValidationError::Service {
            name: service.name.clone(),
            message: message.to_string(),
        };
        if service.name.is_empty() {
            errors.push(fail("name must not be empty"));
        } else if !seen.insert(service.name.as_str()) {
            errors.push(fail("duplicate service name"));
        }
        if service.prefix.is_empty() {
            errors.push(fail("prefix must not be empty"));
        }
        if service.app.is_empty() {
            errors.push(fail("app must not be empty"));
        }
        if service.max_workers == 0 {
            errors.push(fail("max_workers must be at least 1"));
        }
        if !(service.timeout_secs > 0.0) {
            errors.push(fail("timeout_secs must be positive"));
        }
        if !(service.queue_timeout_secs >= 0.0 && service.queue_timeout_secs.is_finite()) {
            errors.push(fail("queue_timeout_secs must be zero or positive"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ServiceConfig, TlsConfig};

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn tls_verification_requires_ca_bundle() {
        let mut config = ServerConfig::default();
        config.listener.tls = Some(TlsConfig {
            cert_path: "c.pem".into(),
            key_path: "k.pem".into(),
            verify: VerifyMode::Required,
            ca_path: None,
            allow_proxies: true,
        });
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, ValidationError::Tls(_))));
    }

    #[test]
    fn queue_capacity_zero_is_allowed() {
        let mut config = ServerConfig::default();
        let mut service = ServiceConfig::new("s", "/s", "echo");
        service.queue_capacity = 0;
        service.max_workers = 1;
        config.services.push(service);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn negative_queue_timeout_is_rejected() {
        let mut config = ServerConfig::default();
        let mut service = ServiceConfig::new("s", "/s", "echo");
        service.queue_timeout_secs = -1.0;
        config.services.push(service);
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("queue_timeout_secs"));
    }
}
