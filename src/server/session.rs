//! Server-side session state.
//!
//! A session is created by the first leg that carries an unseen id. Its
//! target connection is opened once, lazily, and shared by both legs:
//!
//! ```text
//! in  request body ──pump──▶ target sink ──▶ target socket
//! out response body ◀── outbound destination ◀──pump── target socket
//! ```
//!
//! The target → out pump lives as long as the session and writes through
//! a swappable [`Destination`], so replacing the `out` leg is a rebind.
//! Each `in` leg gets its own pump, retired through its leg token when a
//! newer `in` request arrives.
//!
//! Each direction finishes on its own. A clean end of the `in` body shuts
//! down the target's write side; target EOF ends the `out` body. The
//! session is evicted once both have happened, on any target error, or
//! when it is left without a live leg.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, RouteEntry};
use crate::error::{Result, TunnelError};
use crate::protocol::{Direction, SessionId};
use crate::pump::{
    reader_source, write_sink, Destination, PumpConfig, PumpOutcome, Sink, StreamPump,
};

use super::routes::RouteTable;

/// Request body of an `in` leg
pub type LegBody = BoxStream<'static, io::Result<Bytes>>;

/// The stream an HTTP request contributes to its session
pub enum LegStream {
    /// Bytes to deliver to the target
    In(LegBody),
    /// Sink feeding the long-lived `out` response
    Out(Sink),
}

impl LegStream {
    pub fn direction(&self) -> Direction {
        match self {
            LegStream::In(_) => Direction::In,
            LegStream::Out(_) => Direction::Out,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableSettings {
    pub pump: PumpConfig,
    pub connect_timeout: Duration,
    pub orphan_timeout: Duration,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            pump: PumpConfig::default(),
            connect_timeout: Duration::from_secs(10),
            orphan_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&Config> for TableSettings {
    fn from(config: &Config) -> Self {
        Self {
            pump: config.pump_config(),
            connect_timeout: config.server.connect_timeout(),
            orphan_timeout: config.server.orphan_timeout(),
        }
    }
}

/// How a leg stopped carrying bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegEnd {
    /// Its direction of the session is complete
    Finished,
    /// A newer request for the same direction took over
    Superseded,
}

/// A bound leg. Cancelling its token retires the leg.
pub struct LegHandle {
    id: SessionId,
    token: CancellationToken,
    /// Fired when the leg's direction is complete
    done: CancellationToken,
    /// Fired when the whole session is closed
    closed: CancellationToken,
    task: Option<JoinHandle<io::Result<PumpOutcome>>>,
}

impl LegHandle {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait until the leg stops carrying bytes.
    ///
    /// A leg cut short by the session closing yields
    /// [`TunnelError::SessionClosed`]; a failed `in` pump yields its error.
    pub async fn finished(self) -> Result<LegEnd> {
        let completed = match self.task {
            Some(task) => match task.await {
                Ok(outcome) => matches!(outcome?, PumpOutcome::SourceClosed { .. }),
                Err(e) => return Err(io::Error::other(e).into()),
            },
            None => {
                self.token.cancelled().await;
                self.done.is_cancelled() && !self.closed.is_cancelled()
            }
        };

        if completed {
            Ok(LegEnd::Finished)
        } else if self.closed.is_cancelled() {
            Err(TunnelError::SessionClosed(self.id))
        } else {
            Ok(LegEnd::Superseded)
        }
    }
}

/// Connection toward the real target, shared by both legs
#[derive(Clone)]
struct Target {
    /// Feeds the task writing into the target socket
    sink: Sink,
    /// Where target-originated bytes go: the current `out` leg
    outbound: Destination,
}

#[derive(Default)]
struct Legs {
    inbound: Option<CancellationToken>,
    outbound: Option<CancellationToken>,
}

impl Legs {
    fn replace(&mut self, dir: Direction, token: CancellationToken) -> Option<CancellationToken> {
        match dir {
            Direction::In => self.inbound.replace(token),
            Direction::Out => self.outbound.replace(token),
        }
    }

    fn any_live(&self) -> bool {
        [&self.inbound, &self.outbound]
            .into_iter()
            .flatten()
            .any(|token| !token.is_cancelled())
    }
}

struct Session {
    id: SessionId,
    route: RouteEntry,
    cancel: CancellationToken,
    /// Fired when the client finished sending; half-closes the target
    upload_done: CancellationToken,
    /// Fired when the target finished sending; ends the `out` body
    download_done: CancellationToken,
    target: OnceCell<Target>,
    legs: Mutex<Legs>,
}

impl Session {
    fn new(id: SessionId, route: RouteEntry, shutdown: &CancellationToken) -> Arc<Self> {
        let cancel = shutdown.child_token();
        Arc::new(Self {
            id,
            route,
            upload_done: cancel.child_token(),
            download_done: cancel.child_token(),
            cancel,
            target: OnceCell::new(),
            legs: Mutex::new(Legs::default()),
        })
    }
}

struct Inner {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    routes: RouteTable,
    settings: TableSettings,
    shutdown: CancellationToken,
}

/// Session id → session state, the only shared mutable structure on the server
#[derive(Clone)]
pub struct SessionTable {
    inner: Arc<Inner>,
}

impl SessionTable {
    pub fn new(routes: RouteTable, settings: TableSettings, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                routes,
                settings,
                shutdown,
            }),
        }
    }

    pub fn settings(&self) -> &TableSettings {
        &self.inner.settings
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    #[cfg(test)]
    pub async fn contains(&self, id: &SessionId) -> bool {
        self.inner.sessions.lock().await.contains_key(id)
    }

    /// Close every session and stop all pumps.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.sessions.lock().await.clear();
    }

    /// Attach the stream of one HTTP request to session `id`.
    ///
    /// Creates the session and connects to its target on first contact.
    /// A leg already bound for the same direction is retired.
    pub async fn bind_leg(&self, id: &SessionId, stream: LegStream) -> Result<LegHandle> {
        let dir = stream.direction();
        let (session, target) = self.session_for(id).await?;

        let (leg, done) = match dir {
            Direction::In => (session.cancel.child_token(), session.upload_done.clone()),
            Direction::Out => (
                session.download_done.child_token(),
                session.download_done.clone(),
            ),
        };
        let previous = {
            let mut legs = session.legs.lock().await;
            let previous = legs.replace(dir, leg.clone());
            if let LegStream::Out(sink) = &stream {
                target.outbound.bind(sink.clone());
            }
            previous
        };
        if let Some(previous) = previous {
            if !previous.is_cancelled() {
                info!(session = %id, dir = %dir, "retiring superseded leg");
            }
            previous.cancel();
        }

        match stream {
            LegStream::Out(_) => {
                debug!(session = %id, "out leg bound");
                Ok(LegHandle {
                    id: id.clone(),
                    token: leg,
                    done,
                    closed: session.cancel.clone(),
                    task: None,
                })
            }
            LegStream::In(body) => {
                debug!(session = %id, "in leg bound");
                let pump = StreamPump::new(
                    body,
                    Destination::bound(target.sink),
                    self.inner.settings.pump,
                    leg.clone(),
                );
                let closed = session.cancel.clone();
                let token = leg.clone();
                let task = tokio::spawn(async move {
                    let outcome = pump.run().await;
                    match &outcome {
                        Ok(PumpOutcome::SourceClosed { bytes }) => {
                            info!(session = %session.id, bytes, "client finished sending");
                            session.upload_done.cancel();
                        }
                        Ok(PumpOutcome::Cancelled { bytes }) => {
                            debug!(session = %session.id, bytes, "in leg retired");
                        }
                        Err(e) => {
                            warn!(session = %session.id, "in leg failed: {}", e);
                        }
                    }
                    token.cancel();
                    outcome
                });
                Ok(LegHandle {
                    id: id.clone(),
                    token: leg,
                    done,
                    closed,
                    task: Some(task),
                })
            }
        }
    }

    async fn session_for(&self, id: &SessionId) -> Result<(Arc<Session>, Target)> {
        let session = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get(id) {
                Some(session) => session.clone(),
                None => {
                    let route = self.inner.routes.resolve(id)?.clone();
                    info!(session = %id, "new session -> {}:{}", route.host, route.port);

                    let session = Session::new(id.clone(), route, &self.inner.shutdown);
                    sessions.insert(id.clone(), session.clone());
                    self.spawn_reaper(session.clone());
                    session
                }
            }
        };

        let target = session
            .target
            .get_or_try_init(|| self.connect(session.clone()))
            .await;

        match target {
            Ok(target) => Ok((session.clone(), target.clone())),
            Err(e) => {
                self.close(&session, "target connect failed").await;
                Err(e)
            }
        }
    }

    async fn connect(&self, session: Arc<Session>) -> Result<Target> {
        // A waiter queued behind a failed attempt must not reconnect.
        if session.cancel.is_cancelled() {
            return Err(TunnelError::SessionClosed(session.id.clone()));
        }
        let settings = &self.inner.settings;
        let addr = format!("{}:{}", session.route.host, session.route.port);

        let stream = match tokio::time::timeout(settings.connect_timeout, TcpStream::connect(&addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TunnelError::TargetUnreachable {
                    id: session.id.clone(),
                    addr,
                    source,
                })
            }
            Err(_) => {
                return Err(TunnelError::TargetUnreachable {
                    id: session.id.clone(),
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        info!(session = %session.id, "connected to target {}", addr);

        let (read_half, write_half) = stream.into_split();
        let (sink, rx) = settings.pump.channel();
        let outbound = Destination::unbound();

        let table = self.clone();
        let writer_session = session.clone();
        tokio::spawn(async move {
            match write_sink(rx, write_half, writer_session.upload_done.clone()).await {
                Ok(bytes) => {
                    debug!(session = %writer_session.id, bytes, "target writer done");
                    writer_session.download_done.cancelled().await;
                    table.close(&writer_session, "both directions finished").await;
                }
                Err(e) => {
                    warn!(session = %writer_session.id, "target write failed: {}", e);
                    table.close(&writer_session, "target write failed").await;
                }
            }
        });

        let pump = StreamPump::new(
            reader_source(read_half, &settings.pump),
            outbound.clone(),
            settings.pump,
            session.cancel.clone(),
        );
        let table = self.clone();
        tokio::spawn(async move {
            match pump.run().await {
                Ok(PumpOutcome::SourceClosed { bytes }) => {
                    info!(session = %session.id, bytes, "target finished sending");
                    session.download_done.cancel();
                }
                Ok(PumpOutcome::Cancelled { .. }) => {}
                Err(e) => {
                    warn!(session = %session.id, "target read failed: {}", e);
                    table.close(&session, "target read failed").await;
                }
            }
        });

        Ok(Target { sink, outbound })
    }

    fn spawn_reaper(&self, session: Arc<Session>) {
        let table = self.clone();
        let timeout = self.inner.settings.orphan_timeout;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    _ = tokio::time::sleep(timeout) => {}
                }
                if !session.legs.lock().await.any_live() {
                    table.close(&session, "no live legs").await;
                    break;
                }
            }
        });
    }

    /// Evict `session` (if it is still the one registered) and stop it.
    async fn close(&self, session: &Arc<Session>, reason: &str) {
        {
            let mut sessions = self.inner.sessions.lock().await;
            if sessions
                .get(&session.id)
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.remove(&session.id);
            }
        }
        if !session.cancel.is_cancelled() {
            info!(session = %session.id, reason, "session closed");
            session.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RouteId;
    use futures_util::{stream, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn target() -> (TcpListener, RouteEntry) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let route = RouteEntry {
            id: RouteId::from("yan"),
            host: "127.0.0.1".to_string(),
            port,
        };
        (listener, route)
    }

    fn table_with(routes: Vec<RouteEntry>, settings: TableSettings) -> SessionTable {
        SessionTable::new(RouteTable::new(routes), settings, CancellationToken::new())
    }

    fn body(parts: &[&'static str]) -> LegBody {
        stream::iter(
            parts
                .iter()
                .copied()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    async fn eventually_empty(table: &SessionTable) -> bool {
        for _ in 0..100 {
            if table.len().await == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_unknown_route_creates_nothing() {
        let (listener, route) = target().await;
        let table = table_with(vec![route], TableSettings::default());
        let (sink, _rx) = PumpConfig::default().channel();

        let err = table
            .bind_leg(&SessionId::from("missing"), LegStream::Out(sink))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, TunnelError::RouteNotFound(_)));
        assert_eq!(table.len().await, 0);
        let accepted =
            tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "no target connection may be attempted");
    }

    #[tokio::test]
    async fn test_in_leg_reaches_target() {
        let (listener, route) = target().await;
        let table = table_with(vec![route], TableSettings::default());
        let id = SessionId::from("yan");

        let handle = table
            .bind_leg(&id, LegStream::In(body(&["PI", "NG"])))
            .await
            .unwrap();

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"PING");
        assert_eq!(handle.finished().await.unwrap(), LegEnd::Finished);

        // Half-closed: the session lives until the target closes too.
        assert!(table.contains(&id).await);
        drop(socket);
        assert!(eventually_empty(&table).await);
    }

    #[tokio::test]
    async fn test_out_leg_replacement_retires_previous() {
        let (listener, route) = target().await;
        let table = table_with(vec![route], TableSettings::default());
        let id = SessionId::from("yan");
        let config = PumpConfig::default();

        let (first_tx, mut first_rx) = config.channel();
        let first = table.bind_leg(&id, LegStream::Out(first_tx)).await.unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();

        let (second_tx, mut second_rx) = config.channel();
        let second = table.bind_leg(&id, LegStream::Out(second_tx)).await.unwrap();

        socket.write_all(b"PONG").await.unwrap();
        assert_eq!(second_rx.recv().await.unwrap(), Bytes::from_static(b"PONG"));

        assert!(first.token().is_cancelled());
        assert!(!second.token().is_cancelled());
        assert!(first_rx.recv().await.is_none());

        let again =
            tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(again.is_err(), "target must be connected only once");
    }

    #[tokio::test]
    async fn test_in_leg_replacement_retires_previous() {
        let (listener, route) = target().await;
        let table = table_with(vec![route], TableSettings::default());
        let id = SessionId::from("yan");

        let first = table
            .bind_leg(&id, LegStream::In(stream::pending().boxed()))
            .await
            .unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();

        let (tx, rx) = tokio::sync::mpsc::channel::<io::Result<Bytes>>(4);
        let rx_stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let second = table
            .bind_leg(&id, LegStream::In(rx_stream.boxed()))
            .await
            .unwrap();

        assert_eq!(first.finished().await.unwrap(), LegEnd::Superseded);
        tx.send(Ok(Bytes::from_static(b"hello"))).await.unwrap();

        let mut buf = [0u8; 5];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert!(!second.token().is_cancelled());
        assert!(table.contains(&id).await);
    }

    #[tokio::test]
    async fn test_target_unreachable() {
        let (listener, route) = target().await;
        drop(listener);
        let table = table_with(vec![route], TableSettings::default());
        let (sink, _rx) = PumpConfig::default().channel();

        let err = table
            .bind_leg(&SessionId::from("yan"), LegStream::Out(sink))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, TunnelError::TargetUnreachable { .. }));
        assert!(err.is_fatal());
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn test_target_eof_ends_only_out_direction() {
        let (listener, route) = target().await;
        let table = table_with(vec![route], TableSettings::default());
        let id = SessionId::from("yan");
        let (sink, _rx) = PumpConfig::default().channel();

        let out = table.bind_leg(&id, LegStream::Out(sink)).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        let (mut target_read, mut target_write) = socket.into_split();
        target_write.shutdown().await.unwrap();

        assert_eq!(out.finished().await.unwrap(), LegEnd::Finished);
        assert!(table.contains(&id).await);

        let upload = table
            .bind_leg(&id, LegStream::In(body(&["still ", "flowing"])))
            .await
            .unwrap();
        let mut received = Vec::new();
        target_read.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"still flowing");
        assert_eq!(upload.finished().await.unwrap(), LegEnd::Finished);

        assert!(eventually_empty(&table).await);
    }

    #[tokio::test]
    async fn test_target_error_evicts_session() {
        let (listener, route) = target().await;
        let table = table_with(vec![route], TableSettings::default());
        let id = SessionId::from("yan");
        let (tx, rx) = tokio::sync::mpsc::channel::<io::Result<Bytes>>(4);
        let rx_stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        let upload = table
            .bind_leg(&id, LegStream::In(rx_stream.boxed()))
            .await
            .unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);

        for _ in 0..50 {
            if tx.send(Ok(Bytes::from_static(b"data"))).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(eventually_empty(&table).await);
        assert!(matches!(
            upload.finished().await,
            Err(TunnelError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_stalled_out_leg_does_not_block_replacement() {
        let (listener, route) = target().await;
        let settings = TableSettings {
            pump: PumpConfig {
                channel_capacity: 1,
                ..PumpConfig::default()
            },
            ..TableSettings::default()
        };
        let table = table_with(vec![route], settings.clone());
        let id = SessionId::from("yan");

        let (first_tx, mut first_rx) = settings.pump.channel();
        let _first = table.bind_leg(&id, LegStream::Out(first_tx)).await.unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();

        socket.write_all(b"AAAA").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        socket.write_all(b"BBBB").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (second_tx, mut second_rx) = settings.pump.channel();
        let _second = table.bind_leg(&id, LegStream::Out(second_tx)).await.unwrap();
        socket.write_all(b"PONG").await.unwrap();

        let mut received = Vec::new();
        while received.len() < 8 {
            let chunk = tokio::time::timeout(Duration::from_secs(2), second_rx.recv())
                .await
                .expect("replacement out leg never received bytes")
                .unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"BBBBPONG");

        assert_eq!(first_rx.recv().await.unwrap(), Bytes::from_static(b"AAAA"));
        assert!(first_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_session_does_not_reconnect() {
        let (listener, route) = target().await;
        let table = table_with(vec![route.clone()], TableSettings::default());
        let session = Session::new(SessionId::from("yan"), route, &CancellationToken::new());
        session.cancel.cancel();

        let result = session
            .target
            .get_or_try_init(|| table.connect(session.clone()))
            .await;

        assert!(matches!(result, Err(TunnelError::SessionClosed(_))));
        let accepted =
            tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "no target connection may be attempted");
    }

    #[tokio::test]
    async fn test_orphaned_session_evicted() {
        let (listener, route) = target().await;
        let settings = TableSettings {
            orphan_timeout: Duration::from_millis(50),
            ..TableSettings::default()
        };
        let table = table_with(vec![route], settings);
        let (sink, _rx) = PumpConfig::default().channel();

        let leg = table
            .bind_leg(&SessionId::from("yan"), LegStream::Out(sink))
            .await
            .unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();
        leg.token().cancel();

        assert!(eventually_empty(&table).await);
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_per_connection_ids_share_route() {
        let (listener, route) = target().await;
        let table = table_with(vec![route.clone()], TableSettings::default());
        let config = PumpConfig::default();

        let a = SessionId::per_connection(&route.id);
        let b = SessionId::per_connection(&route.id);
        let (tx_a, _rx_a) = config.channel();
        let (tx_b, _rx_b) = config.channel();
        table.bind_leg(&a, LegStream::Out(tx_a)).await.unwrap();
        table.bind_leg(&b, LegStream::Out(tx_b)).await.unwrap();

        listener.accept().await.unwrap();
        listener.accept().await.unwrap();
        assert_eq!(table.len().await, 2);
    }
}
