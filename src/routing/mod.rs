//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Parsed request (URI)
//!     → router.rs (load current ServiceTable snapshot)
//!     → matcher.rs (prefix test in declaration order, URI rewrite)
//!     → BackendService::accept, or NoMatch / Unavailable
//!
//! Reconfiguration:
//!     ServiceConfig[]
//!     → ServiceTable::build (unchanged services carried over)
//!     → atomic swap
//!     → retired services drained in the background
//! ```
//!
//! # Design Decisions
//! - Tables are immutable; updates publish a whole new table
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same service
//! - First match wins (declaration order)

pub mod matcher;
pub mod router;

pub use matcher::PrefixRule;
pub use router::{DispatchResult, Dispatcher, ServiceTable};
