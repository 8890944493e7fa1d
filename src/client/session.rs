//! One accepted local connection bridged to a tunnel session.
//!
//! Four tasks per session:
//! - local reader: local socket → upload channel
//! - `in` leg: keeps a POST whose streaming body drains the upload channel
//! - `out` leg: keeps a GET whose response body is pumped to the local writer
//! - local writer: drains into the local socket
//!
//! The local reader is started before either leg exists. What it reads
//! stays queued in the upload channel until an `in` body pulls it, and a
//! failed `in` attempt leaves unread chunks for the next one.
//!
//! Each direction finishes on its own: local EOF ends the `in` body, a
//! clean end of the `out` body shuts down the local write side. The
//! session closes once both are done, or on any failure it gives up on.

use futures_util::TryStreamExt;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::SessionId;
use crate::pump::{
    reader_source, sink_stream, write_sink, Destination, PumpOutcome, SharedReceiver, StreamPump,
};

use super::leg::{Backoff, ClientContext};

/// Handle to a running client session
pub struct ClientSession {
    id: SessionId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ClientSession {
    /// Start bridging `socket`; the session stops when `parent` is cancelled.
    pub fn start(
        ctx: Arc<ClientContext>,
        id: SessionId,
        socket: TcpStream,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let task = tokio::spawn(run_session(ctx, id.clone(), socket, cancel.clone()));
        Self { id, cancel, task }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until every task of the session has stopped.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(session = %self.id, "session task failed: {}", e);
        }
    }
}

/// Per-direction progress of one session
#[derive(Clone)]
struct Progress {
    /// Local EOF: the `in` body ends once drained
    upload_done: CancellationToken,
    /// The endpoint accepted the whole upload
    delivered: CancellationToken,
    /// The target finished sending: the local write side is shut down
    download_done: CancellationToken,
}

impl Progress {
    fn new(cancel: &CancellationToken) -> Self {
        Self {
            upload_done: cancel.child_token(),
            delivered: cancel.child_token(),
            download_done: cancel.child_token(),
        }
    }
}

async fn run_session(
    ctx: Arc<ClientContext>,
    id: SessionId,
    socket: TcpStream,
    cancel: CancellationToken,
) {
    if let Err(e) = socket.set_nodelay(true) {
        debug!("set_nodelay failed: {}", e);
    }
    let (read_half, write_half) = socket.into_split();

    let progress = Progress::new(&cancel);
    let (upstream_sink, upstream) = ctx.pump.shared_channel();
    let (local_sink, local_rx) = ctx.pump.channel();

    let writer = {
        let id = id.clone();
        let cancel = cancel.clone();
        let progress = progress.clone();
        tokio::spawn(async move {
            match write_sink(local_rx, write_half, progress.download_done).await {
                Ok(bytes) => {
                    debug!(session = %id, bytes, "local writer done");
                    progress.delivered.cancelled().await;
                }
                Err(e) => warn!(session = %id, "local write failed: {}", e),
            }
            cancel.cancel();
        })
    };

    let reader = {
        let id = id.clone();
        let cancel = cancel.clone();
        let upload_done = progress.upload_done.clone();
        let pump = StreamPump::new(
            reader_source(read_half, &ctx.pump),
            Destination::bound(upstream_sink),
            ctx.pump,
            cancel.clone(),
        );
        tokio::spawn(async move {
            match pump.run().await {
                Ok(PumpOutcome::SourceClosed { bytes }) => {
                    debug!(session = %id, bytes, "local connection finished sending");
                    upload_done.cancel();
                }
                Ok(PumpOutcome::Cancelled { .. }) => {}
                Err(e) => {
                    warn!(session = %id, "local read failed: {}", e);
                    cancel.cancel();
                }
            }
        })
    };

    let out_leg = tokio::spawn(run_out_leg(
        ctx.clone(),
        id.clone(),
        Destination::bound(local_sink),
        progress.clone(),
        cancel.clone(),
    ));
    let in_leg = tokio::spawn(run_in_leg(
        ctx,
        id.clone(),
        upstream,
        progress,
        cancel.clone(),
    ));

    cancel.cancelled().await;
    let (writer, reader, out_leg, in_leg) = tokio::join!(writer, reader, out_leg, in_leg);
    for (task, result) in [
        ("writer", writer),
        ("reader", reader),
        ("out leg", out_leg),
        ("in leg", in_leg),
    ] {
        if let Err(e) = result {
            warn!(session = %id, "{} task failed: {}", task, e);
        }
    }
    info!(session = %id, "session closed");
}

/// Keep an `out` leg open and pump its body into the local socket.
///
/// A clean end of the body means the target finished sending, so only the
/// local write side is shut down.
async fn run_out_leg(
    ctx: Arc<ClientContext>,
    id: SessionId,
    local: Destination,
    progress: Progress,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(&ctx.retry);

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = ctx.open_out(&id) => attempt,
        };

        match attempt {
            Ok(response) => {
                backoff.reset();
                info!(session = %id, "out leg established");
                let source = response.bytes_stream().map_err(io::Error::other);
                let pump = StreamPump::new(source, local.clone(), ctx.pump, cancel.clone());
                match pump.run().await {
                    Ok(PumpOutcome::SourceClosed { bytes }) => {
                        info!(session = %id, bytes, "tunnel finished the out leg");
                        progress.download_done.cancel();
                        break;
                    }
                    Ok(PumpOutcome::Cancelled { .. }) => break,
                    Err(e) => warn!(session = %id, "out leg failed: {}", e),
                }
            }
            Err(e) if e.is_fatal() => {
                error!(session = %id, "out leg: {}", e);
                cancel.cancel();
                break;
            }
            Err(e) => warn!(session = %id, "out leg setup failed: {}", e),
        }

        if !wait_before_retry(&mut backoff, &id, &cancel).await {
            break;
        }
    }
}

/// Keep an `in` leg open whose streaming body drains `upstream`.
///
/// Ends once the local side finished sending and the endpoint accepted
/// the whole body.
async fn run_in_leg(
    ctx: Arc<ClientContext>,
    id: SessionId,
    upstream: SharedReceiver,
    progress: Progress,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(&ctx.retry);

    loop {
        let leg = progress.upload_done.child_token();
        let body = reqwest::Body::wrap_stream(sink_stream(upstream.clone(), leg));

        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = ctx.send_in(&id, body) => result,
        };
        // A leg that carried traffic for a while starts a fresh backoff.
        let long_lived = started.elapsed() >= backoff.initial();

        match result {
            Ok(()) if progress.upload_done.is_cancelled() => {
                debug!(session = %id, "in leg delivered");
                progress.delivered.cancel();
                break;
            }
            Ok(()) => {
                warn!(session = %id, "tunnel ended the in leg early");
                if long_lived {
                    backoff.reset();
                }
            }
            Err(e) if e.is_fatal() => {
                error!(session = %id, "in leg: {}", e);
                cancel.cancel();
                break;
            }
            Err(e) => {
                warn!(session = %id, "in leg failed: {}", e);
                if long_lived && !e.is_connect() {
                    backoff.reset();
                }
            }
        }

        if !wait_before_retry(&mut backoff, &id, &cancel).await {
            break;
        }
    }
}

/// Sleep for the next backoff delay. Returns false if the session should stop.
async fn wait_before_retry(
    backoff: &mut Backoff,
    id: &SessionId,
    cancel: &CancellationToken,
) -> bool {
    let Some(delay) = backoff.next_delay() else {
        error!(session = %id, "giving up on the tunnel, closing local connection");
        cancel.cancel();
        return false;
    };

    info!(session = %id, "reconnecting leg in {:?}", delay);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
