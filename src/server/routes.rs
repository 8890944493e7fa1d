use std::collections::HashMap;

use crate::config::RouteEntry;
use crate::error::{Result, TunnelError};
use crate::protocol::{RouteId, SessionId};

/// Immutable id → target lookup, built once at startup.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    routes: HashMap<RouteId, RouteEntry>,
}

impl RouteTable {
    /// Build from config records; the first record for an id wins.
    pub fn new(entries: impl IntoIterator<Item = RouteEntry>) -> Self {
        let mut routes = HashMap::new();
        for entry in entries {
            routes.entry(entry.id.clone()).or_insert(entry);
        }
        Self { routes }
    }

    /// Resolve a session to its target, by exact id and then by route key.
    pub fn resolve(&self, id: &SessionId) -> Result<&RouteEntry> {
        self.routes
            .get(&RouteId(id.0.clone()))
            .or_else(|| self.routes.get(&id.route_key()))
            .ok_or_else(|| TunnelError::RouteNotFound(id.clone()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, host: &str, port: u16) -> RouteEntry {
        RouteEntry {
            id: RouteId::from(id),
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_resolve_exact_and_prefixed() {
        let table = RouteTable::new(vec![entry("yan", "localhost", 9000)]);

        assert_eq!(table.resolve(&SessionId::from("yan")).unwrap().port, 9000);
        assert_eq!(
            table
                .resolve(&SessionId::from("yan:0f3c9a"))
                .unwrap()
                .host,
            "localhost"
        );
    }

    #[test]
    fn test_exact_id_beats_route_key() {
        let table = RouteTable::new(vec![
            entry("yan", "localhost", 9000),
            entry("yan:special", "10.0.0.1", 22),
        ]);

        assert_eq!(
            table.resolve(&SessionId::from("yan:special")).unwrap().port,
            22
        );
    }

    #[test]
    fn test_missing_route() {
        let table = RouteTable::new(vec![entry("yan", "localhost", 9000)]);
        let err = table.resolve(&SessionId::from("missing")).unwrap_err();
        assert!(matches!(err, TunnelError::RouteNotFound(id) if id.as_str() == "missing"));
    }

    #[test]
    fn test_first_entry_wins() {
        let table = RouteTable::new(vec![entry("a", "first", 1), entry("a", "second", 2)]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve(&SessionId::from("a")).unwrap().host, "first");
    }
}
