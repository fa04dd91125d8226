//! Configuration loading from disk.
//!
//! Service entries are expanded before deserialization: start from
//! `[defaults]`, overlay the entry's template, overlay the entry itself,
//! then stamp out one service per element of `names` if present.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::{ServerConfig, ServiceConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Service entry #{index}: {message}")]
    Service { index: usize, message: String },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<ServerConfig, ConfigError> {
    let mut document: toml::Table = toml::from_str(content)?;

    let defaults = take_table(&mut document, "defaults");
    let templates = take_table(&mut document, "templates");
    let entries = match document.remove("services") {
        Some(toml::Value::Array(entries)) => entries,
        Some(_) => {
            return Err(ConfigError::Service {
                index: 0,
                message: "`services` must be an array of tables".to_string(),
            })
        }
        None => Vec::new(),
    };

    let mut config: ServerConfig = toml::Value::Table(document).try_into()?;
    config.services = expand_services(&defaults, &templates, entries)?;

    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

fn take_table(document: &mut toml::Table, key: &str) -> toml::Table {
    match document.remove(key) {
        Some(toml::Value::Table(table)) => table,
        _ => toml::Table::new(),
    }
}

fn expand_services(
    defaults: &toml::Table,
    templates: &toml::Table,
    entries: Vec<toml::Value>,
) -> Result<Vec<ServiceConfig>, ConfigError> {
    let mut services = Vec::new();

    for (index, entry) in entries.into_iter().enumerate() {
        let entry = match entry {
            toml::Value::Table(table) => table,
            _ => {
                return Err(ConfigError::Service {
                    index,
                    message: "service entry must be a table".to_string(),
                })
            }
        };

        let mut merged = defaults.clone();
        if let Some(template) = entry.get("template").and_then(|t| t.as_str()) {
            match templates.get(template) {
                Some(toml::Value::Table(fields)) => overlay(&mut merged, fields),
                _ => {
                    return Err(ConfigError::Service {
                        index,
                        message: format!("unknown template `{}`", template),
                    })
                }
            }
        }
        overlay(&mut merged, &entry);

        let names = match merged.remove("names") {
            Some(toml::Value::Array(names)) => names
                .into_iter()
                .map(|n| match n {
                    toml::Value::String(s) => Ok(s),
                    other => Err(ConfigError::Service {
                        index,
                        message: format!("`names` must hold strings, found {}", other),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(ConfigError::Service {
                    index,
                    message: "`names` must be an array".to_string(),
                })
            }
            None => Vec::new(),
        };

        if names.is_empty() {
            services.push(into_service(index, merged)?);
        } else {
            for name in names {
                let mut copy = merged.clone();
                copy.insert("name".to_string(), toml::Value::String(name));
                services.push(into_service(index, copy)?);
            }
        }
    }

    Ok(services)
}

fn overlay(base: &mut toml::Table, fields: &toml::Table) {
    for (key, value) in fields {
        base.insert(key.clone(), value.clone());
    }
}

fn into_service(index: usize, table: toml::Table) -> Result<ServiceConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Service {
            index,
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::VerifyMode;

    #[test]
    fn parses_listener_and_services_in_order() {
        let config = parse_config(
            r#"
            [listener]
            port = 9000
            header_timeout_secs = 2.5

            [[services]]
            name = "api"
            prefix = "/api"
            app = "echo"

            [[services]]
            name = "root"
            prefix = "/"
            app = "text"
            args = { body = "hi" }
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.port, 9000);
        assert_eq!(config.listener.header_timeout_secs, 2.5);
        assert_eq!(config.listener.max_header_bytes, 100_000);
        let names: Vec<_> = config.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["api", "root"]);
        assert_eq!(config.services[1].args["body"].as_str(), Some("hi"));
        assert_eq!(config.services[0].max_workers, 5);
    }

    #[test]
    fn defaults_templates_and_names_are_expanded() {
        let config = parse_config(
            r#"
            [defaults]
            max_workers = 2
            queue_capacity = 0

            [templates.static]
            app = "files"
            args = { root = "/srv" }
            queue_capacity = 4

            [[services]]
            names = ["a", "b"]
            template = "static"
            prefix = "/static"

            [[services]]
            name = "c"
            app = "echo"
            max_workers = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.services.len(), 3);
        let a = &config.services[0];
        assert_eq!(a.name, "a");
        assert_eq!(a.app, "files");
        assert_eq!(a.max_workers, 2);
        assert_eq!(a.queue_capacity, 4);
        assert_eq!(config.services[1].name, "b");
        let c = &config.services[2];
        assert_eq!(c.max_workers, 7);
        assert_eq!(c.queue_capacity, 0);
        assert_eq!(c.prefix, "/");
    }

    #[test]
    fn unknown_template_is_reported() {
        let err = parse_config(
            r#"
            [[services]]
            name = "x"
            app = "echo"
            template = "missing"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Service { index: 0, .. }));
    }

    #[test]
    fn tls_section_parses_verify_mode() {
        let config = parse_config(
            r#"
            [listener.tls]
            cert_path = "cert.pem"
            key_path = "key.pem"
            verify = "optional"
            ca_path = "ca.pem"
            "#,
        )
        .unwrap();
        let tls = config.listener.tls.unwrap();
        assert_eq!(tls.verify, VerifyMode::Optional);
    }

    #[test]
    fn validation_errors_are_collected() {
        let err = parse_config(
            r#"
            [[services]]
            name = "dup"
            app = "echo"
            max_workers = 0

            [[services]]
            name = "dup"
            app = "echo"
            "#,
        )
        .unwrap_err();
        match err {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {}", other),
        }
    }
}
