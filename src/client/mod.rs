//! Tunnel client implementation.
//!
//! This module provides the local half of the tunnel:
//! - [`LocalListener`] - accepts local TCP connections
//! - `ClientSession` - bridges one connection to its `in` and `out` legs
//! - [`ClientContext`] - shared HTTP client and leg requests, with retry backoff

mod leg;
mod listener;
mod session;

pub use leg::ClientContext;
pub use listener::LocalListener;
