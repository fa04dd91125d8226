//! Application factories and backend loading.
//!
//! # Responsibilities
//! - Map factory names (the `app` key of a service entry) to constructors
//! - Build a [`BackendHandle`] from a service's [`AppSpec`]
//!
//! # Design Decisions
//! - The registry is an explicit object built once at startup and passed to
//!   whoever loads backends; there is no global plugin table
//! - Factories see only their arguments. Reloading a backend means calling
//!   its factory again and publishing the new handle

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

use crate::config::ServiceConfig;
use crate::service::app::Application;
use crate::service::builtin;

/// Factory arguments, straight from the service's `args` table.
pub type AppArgs = toml::Table;

/// Constructor for one kind of application.
pub type AppFactory = Arc<dyn Fn(&AppArgs) -> Result<Arc<dyn Application>, LoadError> + Send + Sync>;

/// Failure to load a backend.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unknown application '{0}'")]
    UnknownApp(String),
    #[error("invalid arguments for '{app}': {message}")]
    InvalidArgs { app: String, message: String },
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What to load: factory name, its arguments and, for logging and
/// `SCRIPT_FILENAME`, the file the application is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSpec {
    pub app: String,
    pub args: AppArgs,
    pub source_path: Option<PathBuf>,
}

impl AppSpec {
    /// Spec for a configured service. The source path is taken from the
    /// `file` or `root` argument when present.
    pub fn from_service(service: &ServiceConfig) -> Self {
        let source_path = ["file", "root"]
            .iter()
            .find_map(|key| service.args.get(*key).and_then(|v| v.as_str()))
            .map(PathBuf::from);
        Self {
            app: service.app.clone(),
            args: service.args.clone(),
            source_path,
        }
    }
}

/// A loaded application plus where it came from.
#[derive(Clone)]
pub struct BackendHandle {
    app: Arc<dyn Application>,
    spec: AppSpec,
    loaded_at: SystemTime,
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("app", &self.spec.app)
            .field("source", &self.spec.source_path)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

impl BackendHandle {
    pub fn new(app: Arc<dyn Application>, spec: AppSpec) -> Self {
        Self {
            app,
            spec,
            loaded_at: SystemTime::now(),
        }
    }

    pub fn app(&self) -> &Arc<dyn Application> {
        &self.app
    }

    pub fn spec(&self) -> &AppSpec {
        &self.spec
    }

    /// Value for `SCRIPT_FILENAME`: the source path, or empty.
    pub fn source(&self) -> String {
        self.spec
            .source_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }
}

/// Named application factories.
#[derive(Clone, Default)]
pub struct AppRegistry {
    factories: BTreeMap<String, AppFactory>,
}

impl fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AppRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `echo`, `text` and `files` applications.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", builtin::echo_factory);
        registry.register("text", builtin::text_factory);
        registry.register("files", builtin::files_factory);
        registry
    }

    /// Add or replace a factory.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&AppArgs) -> Result<Arc<dyn Application>, LoadError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Register a ready-made application instance under `name`.
    /// Every load returns the same instance.
    pub fn register_instance(&mut self, name: impl Into<String>, app: Arc<dyn Application>) {
        self.register(name, move |_args: &AppArgs| Ok(app.clone()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Run the factory named by `spec.app`.
    pub fn load(&self, spec: &AppSpec) -> Result<BackendHandle, LoadError> {
        let factory = self
            .factories
            .get(&spec.app)
            .ok_or_else(|| LoadError::UnknownApp(spec.app.clone()))?;
        let app = factory(&spec.args)?;
        tracing::debug!(app = %spec.app, source = ?spec.source_path, "Backend loaded");
        Ok(BackendHandle::new(app, spec.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::app::{from_fn, Reply, Request};

    #[test]
    fn builtins_are_registered() {
        let registry = AppRegistry::with_builtins();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["echo", "files", "text"]);
    }

    #[test]
    fn unknown_app_fails_to_load() {
        let registry = AppRegistry::with_builtins();
        let spec = AppSpec {
            app: "nope".to_string(),
            args: AppArgs::new(),
            source_path: None,
        };
        assert!(matches!(registry.load(&spec), Err(LoadError::UnknownApp(name)) if name == "nope"));
    }

    #[test]
    fn spec_takes_source_from_args() {
        let mut service = ServiceConfig::new("t", "/t", "text");
        service
            .args
            .insert("file".to_string(), toml::Value::String("/srv/hello.txt".to_string()));
        let spec = AppSpec::from_service(&service);
        assert_eq!(spec.source_path, Some(PathBuf::from("/srv/hello.txt")));
    }

    #[test]
    fn registered_instance_is_shared() {
        let mut registry = AppRegistry::new();
        let app: Arc<dyn Application> = Arc::new(from_fn(|_r: Request| async { Ok(Reply::ok()) }));
        registry.register_instance("fixed", app.clone());
        let spec = AppSpec {
            app: "fixed".to_string(),
            args: AppArgs::new(),
            source_path: None,
        };
        let a = registry.load(&spec).unwrap();
        let b = registry.load(&spec).unwrap();
        assert!(Arc::ptr_eq(a.app(), b.app()));
        assert!(Arc::ptr_eq(a.app(), &app));
        assert_eq!(a.source(), "");
    }
}
