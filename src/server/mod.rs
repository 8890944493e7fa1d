//! Tunnel server implementation.
//!
//! This module terminates the two HTTP legs of every session and bridges
//! them to a real TCP connection:
//! - [`TunnelEndpoint`] - HTTP entry point receiving `{id, dir}`
//! - [`SessionTable`] - per-session state, lazy target connect, leg rebinding
//! - [`RouteTable`] - id → target lookup loaded from the config

mod endpoint;
mod routes;
mod session;

pub use endpoint::TunnelEndpoint;
pub use routes::RouteTable;
pub use session::{SessionTable, TableSettings};
