//! Wire-level vocabulary shared by both ends of the tunnel.
//!
//! - [`SessionId`] / [`RouteId`] - type-safe identifiers
//! - [`Direction`] and [`LegQuery`] - the `?id=&dir=` contract of the endpoint
//! - [`browser_headers`] - header set sent on every leg request
//!
//! No framing is added on the legs: each one is a raw byte pipe.

mod headers;
mod ids;
mod leg;

pub use headers::*;
pub use ids::*;
pub use leg::*;
