//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (optional TLS handshake)
//!     → connection.rs (request id, stream ownership, close-once)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Connection admission is bounded by a semaphore; excess clients wait
//!   in the kernel backlog
//! - The listening socket may be bound here or inherited from the supervisor
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ClientStream, ConnectionRecord, RequestId};
pub use listener::{bind_shared, ConnectionPermit, Listener, ListenerError};
pub use tls::{PeerIdentity, TlsError, TlsTerminator};
