use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use super::SessionId;

/// Which half of a session an HTTP exchange carries.
///
/// Named from the server's point of view: `in` delivers bytes into the
/// tunnel (request body → target), `out` carries bytes out of it
/// (target → response body).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query string of a tunnel request: `?id=<session>&dir=<in|out>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegQuery {
    pub id: SessionId,
    pub dir: Direction,
}

/// Build the URL of one leg from the tunnel endpoint URL.
///
/// Existing query pairs on `tunnel_url` are kept; `id` and `dir` are appended.
pub fn leg_url(tunnel_url: &Url, id: &SessionId, dir: Direction) -> Url {
    let mut url = tunnel_url.clone();
    url.query_pairs_mut()
        .append_pair("id", id.as_str())
        .append_pair("dir", dir.as_str());
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leg_url() {
        let base = Url::parse("http://localhost:57244/tunnel").unwrap();
        let url = leg_url(&base, &SessionId::from("yan"), Direction::Out);
        assert_eq!(url.as_str(), "http://localhost:57244/tunnel?id=yan&dir=out");
    }

    #[test]
    fn test_leg_url_escapes_id() {
        let base = Url::parse("http://localhost/tunnel?v=1").unwrap();
        let url = leg_url(&base, &SessionId::from("a b&c"), Direction::In);
        assert_eq!(url.query(), Some("v=1&id=a+b%26c&dir=in"));
    }

    #[test]
    fn test_direction_rejects_unknown() {
        let parsed: Result<LegQuery, _> = toml::from_str("id = \"yan\"\ndir = \"sideways\"");
        assert!(parsed.is_err());

        let parsed: LegQuery = toml::from_str("id = \"yan\"\ndir = \"in\"").unwrap();
        assert_eq!(parsed.dir, Direction::In);
    }
}
