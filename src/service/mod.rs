//! Backend services subsystem.
//!
//! # Data Flow
//! ```text
//! ServiceConfig
//!     → registry.rs (factory lookup → BackendHandle)
//!     → backend.rs (admission, FIFO queue, worker pool)
//!     → app.rs (Application::call with Environ + BodyReader)
//!     → ResponseWriter → client
//! ```
//!
//! # Design Decisions
//! - Two levels of backpressure: connection readers (server) and per-service
//!   admission (here)
//! - Applications are plain trait objects; built-ins live in builtin.rs

pub mod app;
pub mod backend;
pub mod builtin;
pub mod registry;

pub use app::{from_fn, AppError, AppFuture, Application, Reply, Request};
pub use backend::{Admission, BackendService};
pub use registry::{AppArgs, AppRegistry, AppSpec, BackendHandle, LoadError};
