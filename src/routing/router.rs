//! Service lookup and dispatch.
//!
//! # Responsibilities
//! - Hold the ordered service list in effect
//! - Match a request URI against the services, first match wins
//! - Rewrite the URI for the matched service and hand the connection over
//! - Swap the whole service list on reconfiguration
//!
//! # Design Decisions
//! - The list is an immutable [`ServiceTable`] published through `ArcSwap`;
//!   one dispatch loads one snapshot, so it never sees half of an update
//! - First match in declaration order, not longest match: operators list
//!   more specific prefixes first
//! - O(n) prefix scan (acceptable for typical service counts)
//! - Explicit NoMatch rather than silent default

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::ServiceConfig;
use crate::net::connection::ConnectionRecord;
use crate::service::backend::{Admission, BackendService};
use crate::service::registry::{AppRegistry, LoadError};

/// One immutable generation of the service list.
#[derive(Debug, Default)]
pub struct ServiceTable {
    version: u64,
    services: Vec<Arc<BackendService>>,
}

impl ServiceTable {
    pub fn new(version: u64, services: Vec<Arc<BackendService>>) -> Self {
        Self { version, services }
    }

    /// Load every configured service. Services whose configuration is
    /// unchanged in `previous` are carried over as they are, queue and all.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(
        configs: &[ServiceConfig],
        registry: &AppRegistry,
        version: u64,
        previous: Option<&ServiceTable>,
    ) -> Result<Self, LoadError> {
        let mut services = Vec::with_capacity(configs.len());
        for config in configs {
            let reused = previous
                .and_then(|table| table.services.iter().find(|s| s.config() == config))
                .cloned();
            let service = match reused {
                Some(service) => service,
                None => BackendService::start(config.clone(), registry)?,
            };
            services.push(service);
        }
        Ok(Self { version, services })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn services(&self) -> &[Arc<BackendService>] {
        &self.services
    }

    /// First service whose prefix is a string prefix of `uri`.
    pub fn find(&self, uri: &str) -> Option<&Arc<BackendService>> {
        self.services.iter().find(|s| s.rule().matches(uri))
    }
}

/// Result of dispatching a parsed connection.
#[derive(Debug)]
pub enum DispatchResult {
    /// A service took the connection.
    Accepted { service: String },
    /// No prefix matched. The caller answers 404.
    NoMatch(ConnectionRecord),
    /// The matched service is full or closed. The caller answers 503.
    Unavailable(ConnectionRecord),
}

/// Routes connections to backend services.
#[derive(Debug)]
pub struct Dispatcher {
    table: ArcSwap<ServiceTable>,
}

impl Dispatcher {
    pub fn new(table: ServiceTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    /// Build the initial table (version 1) from configuration.
    pub fn from_config(configs: &[ServiceConfig], registry: &AppRegistry) -> Result<Self, LoadError> {
        Ok(Self::new(ServiceTable::build(configs, registry, 1, None)?))
    }

    /// The table in effect right now.
    pub fn table(&self) -> Arc<ServiceTable> {
        self.table.load_full()
    }

    /// Match, rewrite and hand the connection to a service.
    ///
    /// Waits only when the matched service is full and has a queue timeout.
    pub async fn dispatch(&self, mut conn: ConnectionRecord) -> DispatchResult {
        let table = self.table.load_full();
        let uri = conn.head.uri().unwrap_or_default().to_string();

        let Some(service) = table.find(&uri).cloned() else {
            return DispatchResult::NoMatch(conn);
        };

        let rule = service.rule();
        if let Some(rewritten) = rule.rewrite(&uri) {
            conn.head.replace_uri(rewritten);
        }
        conn.script_name = rule.script_name().to_string();
        conn.service_name = Some(service.name().to_string());

        tracing::debug!(
            request_id = %conn.id,
            service = %service.name(),
            uri = %uri,
            rewritten = %conn.head.uri().unwrap_or_default(),
            table_version = table.version(),
            "Dispatching"
        );

        match service.admit(conn).await {
            Admission::Accepted => DispatchResult::Accepted {
                service: service.name().to_string(),
            },
            Admission::Unavailable(conn) => DispatchResult::Unavailable(conn),
        }
    }

    /// Publish a new table and return the one it replaced.
    pub fn replace(&self, table: ServiceTable) -> Arc<ServiceTable> {
        tracing::info!(
            version = table.version(),
            services = table.services().len(),
            "Service table replaced"
        );
        self.table.swap(Arc::new(table))
    }

    /// Load a new service list and swap it in. Services that did not survive
    /// are drained in the background.
    ///
    /// On error the current table stays in effect.
    pub fn reconfigure(&self, configs: &[ServiceConfig], registry: &AppRegistry) -> Result<u64, LoadError> {
        let current = self.table();
        let version = current.version() + 1;
        let table = ServiceTable::build(configs, registry, version, Some(&current))?;
        let kept = table.services().to_vec();
        let old = self.replace(table);
        let retired: Vec<_> = old
            .services()
            .iter()
            .filter(|s| !kept.iter().any(|n| Arc::ptr_eq(n, s)))
            .cloned()
            .collect();
        if !retired.is_empty() {
            tokio::spawn(async move {
                for service in retired {
                    service.close().await;
                }
            });
        }
        Ok(version)
    }

    /// Give every service a chance to hot-reload its application.
    /// Returns the number of services that reloaded.
    pub fn reload_services(&self, registry: &AppRegistry) -> usize {
        self.table()
            .services()
            .iter()
            .filter(|s| s.reload_if_needed(registry))
            .count()
    }

    /// Stop routing and wait for every service to drain.
    pub async fn close(&self) {
        let old = self.table.swap(Arc::new(ServiceTable::default()));
        for service in old.services() {
            service.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ClientStream;
    use crate::service::app::{from_fn, Application, Reply, Request};
    use crate::service::registry::{AppArgs, AppSpec, BackendHandle};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    /// A service whose application answers with its own name and the
    /// environment it saw.
    fn named_service(name: &str, prefix: &str, replace: Option<&str>) -> Arc<BackendService> {
        let label = name.to_string();
        let app: Arc<dyn Application> = Arc::new(from_fn(move |req: Request| {
            let label = label.clone();
            async move {
                let body = format!(
                    "{label}|{}|{}",
                    req.environ.script_name(),
                    req.environ.path_info()
                );
                Ok(Reply::text("200 OK", body))
            }
        }));
        let mut config = ServiceConfig::new(name, prefix, "test");
        config.replace_prefix = replace.map(str::to_string);
        config.max_workers = 4;
        config.queue_capacity = 64;
        let spec = AppSpec {
            app: "test".to_string(),
            args: AppArgs::new(),
            source_path: None,
        };
        BackendService::with_handle(config, spec.clone(), BackendHandle::new(app, spec))
    }

    struct Harness {
        listener: TcpListener,
    }

    impl Harness {
        async fn new() -> Self {
            Self {
                listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        /// A parsed connection for `uri` and the client side of its socket.
        async fn connection(&self, uri: &str) -> (ConnectionRecord, TcpStream) {
            let addr = self.listener.local_addr().unwrap();
            let client = TcpStream::connect(addr).await.unwrap();
            let (stream, peer) = self.listener.accept().await.unwrap();
            let mut conn = ConnectionRecord::new(addr.port(), ClientStream::Plain(stream), peer);
            let request = format!("GET {uri} HTTP/1.1\r\nHost: test\r\n\r\n");
            assert!(conn.head.consume(request.as_bytes()).complete);
            (conn, client)
        }
    }

    async fn body_of(mut client: TcpStream) -> String {
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out.split("\r\n\r\n").nth(1).unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_first_match_wins_over_longer_prefix() {
        let harness = Harness::new().await;
        let dispatcher = Dispatcher::new(ServiceTable::new(
            1,
            vec![named_service("a", "/a", None), named_service("ab", "/a/b", None)],
        ));

        let (conn, client) = harness.connection("/a/b/x").await;
        match dispatcher.dispatch(conn).await {
            DispatchResult::Accepted { service } => assert_eq!(service, "a"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(body_of(client).await, "a|/a|/b/x");
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_rewrite_with_replacement_prefix() {
        let harness = Harness::new().await;
        let dispatcher = Dispatcher::new(ServiceTable::new(
            1,
            vec![named_service("v2", "/old/", Some("/v2"))],
        ));

        let (conn, client) = harness.connection("/old/items?id=1").await;
        assert!(matches!(dispatcher.dispatch(conn).await, DispatchResult::Accepted { .. }));
        assert_eq!(body_of(client).await, "v2|/old|/v2/items");
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_no_match_returns_connection() {
        let harness = Harness::new().await;
        let dispatcher = Dispatcher::new(ServiceTable::new(1, vec![named_service("echo", "/echo", None)]));

        let (conn, _client) = harness.connection("/other").await;
        match dispatcher.dispatch(conn).await {
            DispatchResult::NoMatch(conn) => {
                assert!(conn.is_open());
                assert_eq!(conn.service_name, None);
                assert_eq!(conn.head.uri(), Some("/other"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let table = dispatcher.table();
        assert_eq!(table.services()[0].load(), 0);
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_close_empties_table() {
        let harness = Harness::new().await;
        let dispatcher = Dispatcher::new(ServiceTable::new(1, vec![named_service("all", "/", None)]));
        dispatcher.close().await;
        let (conn, _client) = harness.connection("/x").await;
        assert!(matches!(dispatcher.dispatch(conn).await, DispatchResult::NoMatch(_)));
    }

    #[tokio::test]
    async fn test_reconfigure_keeps_unchanged_services() {
        let registry = AppRegistry::with_builtins();
        let echo = ServiceConfig::new("echo", "/echo", "echo");
        let mut text = ServiceConfig::new("text", "/", "text");
        text.args
            .insert("body".to_string(), toml::Value::String("one".to_string()));

        let dispatcher = Dispatcher::from_config(&[echo.clone(), text.clone()], &registry).unwrap();
        let before = dispatcher.table();
        assert_eq!(before.version(), 1);

        text.args
            .insert("body".to_string(), toml::Value::String("two".to_string()));
        let version = dispatcher.reconfigure(&[echo.clone(), text.clone()], &registry).unwrap();
        assert_eq!(version, 2);

        let after = dispatcher.table();
        assert!(Arc::ptr_eq(&before.services()[0], &after.services()[0]));
        assert!(!Arc::ptr_eq(&before.services()[1], &after.services()[1]));

        let bad = ServiceConfig::new("bad", "/bad", "no-such-app");
        assert!(dispatcher.reconfigure(&[bad], &registry).is_err());
        assert_eq!(dispatcher.table().version(), 2);
        dispatcher.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_swap_is_atomic_for_concurrent_dispatch() {
        let old_services = vec![named_service("old-1", "/a", None), named_service("old-2", "/", None)];
        let new_services = vec![named_service("new-1", "/b", None), named_service("new-2", "/", None)];
        let dispatcher = Arc::new(Dispatcher::new(ServiceTable::new(1, old_services.clone())));

        let flipper = {
            let dispatcher = dispatcher.clone();
            let old_services = old_services.clone();
            let new_services = new_services.clone();
            tokio::spawn(async move {
                for i in 0..200u64 {
                    let services = if i % 2 == 0 { &new_services } else { &old_services };
                    dispatcher.replace(ServiceTable::new(i + 2, services.clone()));
                    tokio::task::yield_now().await;
                }
            })
        };

        let harness = Harness::new().await;
        let mut checks = Vec::new();
        for i in 0..100 {
            let uri = if i % 2 == 0 { "/a/x" } else { "/b/x" };
            let (conn, client) = harness.connection(uri).await;
            let result = dispatcher.dispatch(conn).await;
            assert!(matches!(result, DispatchResult::Accepted { .. }));
            checks.push(tokio::spawn(async move { (uri, body_of(client).await) }));
        }
        flipper.await.unwrap();

        for check in checks {
            let (uri, body) = check.await.unwrap();
            let service = body.split('|').next().unwrap().to_string();
            match uri {
                "/a/x" => assert!(service == "old-1" || service == "new-2", "{uri} -> {service}"),
                _ => assert!(service == "old-2" || service == "new-1", "{uri} -> {service}"),
            }
        }

        for service in old_services.iter().chain(new_services.iter()) {
            service.close().await;
        }
    }
}
