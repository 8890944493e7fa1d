//! Configuration management for both ends of the tunnel.
//!
//! Handles loading configuration from `<config dir>/http-tunnel/config.toml`
//! or an explicit path. A missing file yields the defaults.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{RouteId, DEFAULT_USER_AGENT};
use crate::pump::PumpConfig;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pump: PumpSettings,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Route table consulted by the server
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteEntry>,
}

/// How a client listener names the sessions it opens
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// `<session_id>:<uuid>` for every accepted connection
    #[default]
    PerConnection,
    /// Every connection reuses `session_id` as is
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub tunnel_url: String,
    pub session_id: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub session_mode: SessionMode,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tunnel_url: "http://localhost:57244/tunnel".to_string(),
            session_id: "yan".to_string(),
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8888,
            session_mode: SessionMode::PerConnection,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub path: String,
    /// Content type announced on `out` responses
    pub response_content_type: String,
    pub connect_timeout_ms: u64,
    /// A session with no live leg for this long is evicted
    pub orphan_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:57244".to_string(),
            path: "/tunnel".to_string(),
            response_content_type: "application/octet-stream".to_string(),
            connect_timeout_ms: 10_000,
            orphan_timeout_ms: 60_000,
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_millis(self.orphan_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpSettings {
    pub buffer_size: usize,
    pub idle_wait_ms: u64,
    pub channel_capacity: usize,
}

impl Default for PumpSettings {
    fn default() -> Self {
        let defaults = PumpConfig::default();
        Self {
            buffer_size: defaults.buffer_size,
            idle_wait_ms: defaults.idle_wait.as_millis() as u64,
            channel_capacity: defaults.channel_capacity,
        }
    }
}

impl From<&PumpSettings> for PumpConfig {
    fn from(settings: &PumpSettings) -> Self {
        PumpConfig {
            buffer_size: settings.buffer_size.max(1),
            idle_wait: Duration::from_millis(settings.idle_wait_ms),
            channel_capacity: settings.channel_capacity.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before a session gives up
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 8,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }
}

/// One `[[route]]` record: where sessions for `id` are connected to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub id: RouteId,
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "http-tunnel")
            .context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig::from(&self.pump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.client.tunnel_url, "http://localhost:57244/tunnel");
        assert_eq!(config.client.session_id, "yan");
        assert_eq!(config.client.listen_port, 8888);
        assert_eq!(config.client.session_mode, SessionMode::PerConnection);
        assert_eq!(config.server.path, "/tunnel");
        assert_eq!(config.pump_config(), PumpConfig::default());
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_parse_full() {
        let config = Config::parse(
            r#"
            [client]
            tunnel_url = "https://relay.example.com/t"
            session_id = "db"
            listen_port = 15432
            session_mode = "shared"

            [server]
            bind = "127.0.0.1:8080"
            response_content_type = "text/html"

            [pump]
            idle_wait_ms = 25

            [[route]]
            id = "yan"
            host = "localhost"
            port = 9000

            [[route]]
            id = "db"
            host = "10.0.0.5"
            port = 5432
            "#,
        )
        .unwrap();

        assert_eq!(config.client.session_mode, SessionMode::Shared);
        assert_eq!(config.client.listen_host, "0.0.0.0");
        assert_eq!(config.server.response_content_type, "text/html");
        assert_eq!(config.pump_config().idle_wait, Duration::from_millis(25));
        assert_eq!(config.pump_config().buffer_size, 0x1000);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(
            config.routes[1],
            RouteEntry {
                id: RouteId::from("db"),
                host: "10.0.0.5".to_string(),
                port: 5432,
            }
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\nmax_attempts = 3").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:57244");
    }

    #[test]
    fn test_invalid_route_rejected() {
        let result = Config::parse("[[route]]\nid = \"x\"\nhost = \"h\"\nport = 70000");
        assert!(result.is_err());
    }
}
