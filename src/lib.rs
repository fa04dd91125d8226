//! multiserve: an embedded HTTP/1.x application server.
//!
//! # Architecture Overview
//!
//! ```text
//!                   ┌──────────────────────────────────────────────────────────┐
//!                   │                       WORKER                             │
//!                   │                                                          │
//!  Client ─────────▶│ ┌─────────┐   ┌──────────┐   ┌──────────┐   ┌─────────┐  │
//!                   │ │   net   │──▶│   http   │──▶│ routing  │──▶│ service │  │
//!                   │ │listener │   │  reader  │   │dispatcher│   │ workers │  │
//!                   │ │  + tls  │   │  (head)  │   │ (prefix) │   │  (app)  │  │
//!                   │ └─────────┘   └──────────┘   └──────────┘   └────┬────┘  │
//!  Client ◀─────────┼──────────────── http response writer ◀───────────┘       │
//!                   │                                                          │
//!                   │  config · lifecycle (reload/stop) · observability        │
//!                   └──────────────────────────────────────────────────────────┘
//!                        ▲ shared socket, control on stdin, logs on stdout
//!                   ┌────┴─────────────────────────────────────────────────────┐
//!                   │ supervisor: N workers, restarts, reconfigure, log files   │
//!                   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A request is read and parsed by a per-connection reader, matched against
//! the service prefixes in declaration order, queued on the first matching
//! service and executed by one of its workers. Every response closes the
//! connection.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod service;
pub mod supervisor;

pub use config::schema::ServerConfig;
pub use http::HttpServer;
pub use lifecycle::{Shutdown, Worker};
pub use routing::Dispatcher;
pub use service::{from_fn, AppRegistry, Application, Reply, Request};
