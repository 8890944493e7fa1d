use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionMode;
use crate::error::Result;
use crate::protocol::{RouteId, SessionId};

use super::leg::ClientContext;
use super::session::ClientSession;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts local TCP connections and opens one tunnel session per connection.
pub struct LocalListener {
    listener: TcpListener,
    ctx: Arc<ClientContext>,
    route: RouteId,
    mode: SessionMode,
    sessions: Arc<Mutex<HashMap<SessionId, CancellationToken>>>,
}

impl LocalListener {
    /// Bind and start listening immediately.
    pub async fn bind(
        addr: &str,
        ctx: Arc<ClientContext>,
        session_id: &str,
        mode: SessionMode,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            ctx,
            route: RouteId::from(session_id),
            mode,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared view of the active sessions, for inspection while running.
    #[cfg(test)]
    pub fn sessions(&self) -> Arc<Mutex<HashMap<SessionId, CancellationToken>>> {
        self.sessions.clone()
    }

    fn next_session_id(&self) -> SessionId {
        match self.mode {
            SessionMode::PerConnection => SessionId::per_connection(&self.route),
            SessionMode::Shared => SessionId(self.route.0.clone()),
        }
    }

    /// Accept until `shutdown` fires. Accept errors are logged, never fatal.
    pub async fn run(self, shutdown: CancellationToken) {
        match self.local_addr() {
            Ok(addr) => info!(
                "Listening on {} -> {} ({})",
                addr,
                self.ctx.tunnel_url(),
                self.route
            ),
            Err(e) => warn!("Listening on unknown address: {}", e),
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let id = self.next_session_id();
            info!(session = %id, %peer, "accepted local connection");

            let session = ClientSession::start(self.ctx.clone(), id.clone(), socket, &shutdown);
            let token = session.cancel_token();
            if let Some(previous) = self.sessions.lock().await.insert(id.clone(), token) {
                warn!(session = %id, "session id reused, closing the previous connection");
                previous.cancel();
            }

            let sessions = self.sessions.clone();
            tokio::spawn(async move {
                let id = session.id().clone();
                session.join().await;

                let mut sessions = sessions.lock().await;
                if sessions.get(&id).is_some_and(|token| token.is_cancelled()) {
                    sessions.remove(&id);
                }
                debug!(session = %id, "session released");
            });
        }

        info!("Listener stopped");
    }
}
