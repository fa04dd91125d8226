//! Resilience helpers.
//!
//! The supervisor staggers worker restarts with [`backoff::calculate_backoff`]
//! so a worker that dies on startup cannot turn into a restart storm.

pub mod backoff;

pub use backoff::calculate_backoff;
