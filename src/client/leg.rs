use reqwest::header::HeaderMap;
use reqwest::{Body, Client, Response};
use std::time::Duration;
use url::Url;

use crate::config::{Config, RetryConfig};
use crate::error::{Result, TunnelError};
use crate::protocol::{browser_headers, leg_url, Direction, SessionId};
use crate::pump::PumpConfig;

/// Everything a client session needs to reach the tunnel endpoint.
///
/// Shared by all sessions of a listener so they reuse one connection pool.
pub struct ClientContext {
    http: Client,
    tunnel_url: Url,
    headers: HeaderMap,
    pub pump: PumpConfig,
    pub retry: RetryConfig,
}

impl ClientContext {
    pub fn new(
        tunnel_url: &str,
        user_agent: &str,
        pump: PumpConfig,
        retry: RetryConfig,
    ) -> Result<Self> {
        let tunnel_url = Url::parse(tunnel_url)?;
        let http = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            http,
            tunnel_url,
            headers: browser_headers(user_agent),
            pump,
            retry,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.client.tunnel_url,
            &config.client.user_agent,
            config.pump_config(),
            config.retry.clone(),
        )
    }

    pub fn tunnel_url(&self) -> &Url {
        &self.tunnel_url
    }

    /// Open the `out` leg; the response body carries target-originated bytes.
    pub async fn open_out(&self, id: &SessionId) -> Result<Response> {
        let response = self
            .http
            .get(leg_url(&self.tunnel_url, id, Direction::Out))
            .headers(self.headers.clone())
            .send()
            .await?;
        check_status(response, Direction::Out)
    }

    /// Send the `in` leg; resolves once `body` ends and the endpoint answers.
    pub async fn send_in(&self, id: &SessionId, body: Body) -> Result<()> {
        let response = self
            .http
            .post(leg_url(&self.tunnel_url, id, Direction::In))
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await?;
        check_status(response, Direction::In)?;
        Ok(())
    }
}

fn check_status(response: Response, dir: Direction) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TunnelError::LegRejected {
            dir,
            status: status.as_u16(),
        })
    }
}

/// Exponential backoff between leg attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(retry: &RetryConfig) -> Self {
        Self {
            initial: retry.initial_delay(),
            max: retry.max_delay(),
            max_attempts: retry.max_attempts,
            current: retry.initial_delay(),
            attempts: 0,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    /// `max_attempts = 0` retries forever.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.max_attempts > 0 && self.attempts > self.max_attempts {
            return None;
        }
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        Some(delay)
    }
}
