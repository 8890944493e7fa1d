//! Type-safe ID wrappers for tunnel identifiers.
//!
//! These newtypes prevent accidentally mixing up a session id (one
//! logical TCP stream) with a route id (one configured target) at
//! compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separates the route key from the per-connection suffix of a session id.
pub const ROUTE_SEPARATOR: char = ':';

/// Correlation key shared by the two HTTP legs and the target connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// A fresh session id for one accepted connection: `<route>:<uuid>`.
    pub fn per_connection(route: &RouteId) -> Self {
        SessionId(format!(
            "{}{}{}",
            route,
            ROUTE_SEPARATOR,
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// The route this session was opened against.
    pub fn route_key(&self) -> RouteId {
        let key = self
            .0
            .split_once(ROUTE_SEPARATOR)
            .map(|(route, _)| route)
            .unwrap_or(&self.0);
        RouteId(key.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        SessionId(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

/// Identifier of a configured target in the route table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(pub String);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RouteId {
    fn from(s: String) -> Self {
        RouteId(s)
    }
}

impl From<&str> for RouteId {
    fn from(s: &str) -> Self {
        RouteId(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_connection_ids_are_unique() {
        let route = RouteId::from("yan");
        let a = SessionId::per_connection(&route);
        let b = SessionId::per_connection(&route);

        assert_ne!(a, b);
        assert!(a.as_str().starts_with("yan:"));
        assert_eq!(a.route_key(), route);
    }

    #[test]
    fn test_route_key_without_suffix() {
        assert_eq!(SessionId::from("yan").route_key(), RouteId::from("yan"));
    }
}
