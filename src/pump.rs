//! Continuous byte pumps between a source stream and a swappable destination.
//!
//! Every sink in the tunnel is the sending half of a bounded channel. The
//! receiving half is drained either into a socket ([`write_sink`]) or into
//! an HTTP body ([`sink_stream`]). A [`Destination`] is the slot a pump
//! writes through; it may be empty while a leg is still being established,
//! and it may be rebound when a leg is replaced.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Sending half of a byte channel feeding a socket or an HTTP body
pub type Sink = mpsc::Sender<Bytes>;

/// Receiving half of a sink that successive HTTP bodies take turns reading
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<Bytes>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    /// Upper bound of a single read from a socket source
    pub buffer_size: usize,
    /// Pause after a source yields an empty chunk
    pub idle_wait: Duration,
    /// Chunks buffered between a pump and the task draining its sink
    pub channel_capacity: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            buffer_size: 0x1000,
            idle_wait: Duration::from_millis(100),
            channel_capacity: 64,
        }
    }
}

impl PumpConfig {
    pub fn channel(&self) -> (Sink, mpsc::Receiver<Bytes>) {
        mpsc::channel(self.channel_capacity.max(1))
    }

    /// Channel whose queued chunks outlive any single body reading them.
    pub fn shared_channel(&self) -> (Sink, SharedReceiver) {
        let (sink, rx) = self.channel();
        (sink, Arc::new(Mutex::new(rx)))
    }
}

/// Swappable handle to the sink a pump currently writes to.
///
/// Cloning shares the slot. Rebinding is atomic: once [`Destination::bind`]
/// returns, no pump will start a new write to the previous sink, even one
/// that was already waiting for room in it.
#[derive(Debug, Clone)]
pub struct Destination {
    slot: Arc<watch::Sender<Option<Sink>>>,
}

impl Destination {
    pub fn unbound() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    pub fn bound(sink: Sink) -> Self {
        let destination = Self::unbound();
        destination.bind(sink);
        destination
    }

    /// Bind a new sink, returning the one it replaces.
    pub fn bind(&self, sink: Sink) -> Option<Sink> {
        self.slot.send_replace(Some(sink))
    }

    pub fn unbind(&self) -> Option<Sink> {
        self.slot.send_replace(None)
    }

    /// Clear the slot only if it still holds `sink`.
    pub fn unbind_if(&self, sink: &Sink) -> bool {
        self.slot.send_if_modified(|current| match current {
            Some(bound) if bound.same_channel(sink) => {
                *current = None;
                true
            }
            _ => false,
        })
    }

    #[cfg(test)]
    fn current(&self) -> Option<Sink> {
        self.slot.borrow().clone()
    }

}

/// Resolve the sink, waiting until one is bound. Marks the binding as seen.
async fn bound_sink(slot: &mut watch::Receiver<Option<Sink>>) -> Sink {
    loop {
        if let Some(sink) = slot.borrow_and_update().as_ref() {
            return sink.clone();
        }
        // The destination owns the sender, so the channel cannot close under us.
        let _ = slot.changed().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The source reached end of stream
    SourceClosed { bytes: u64 },
    /// The pump was retired or shut down through its token
    Cancelled { bytes: u64 },
}

/// Copies chunks from `source` to whatever `destination` holds at write time.
pub struct StreamPump<S> {
    source: S,
    destination: Destination,
    config: PumpConfig,
    cancel: CancellationToken,
}

impl<S> StreamPump<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    pub fn new(
        source: S,
        destination: Destination,
        config: PumpConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            destination,
            config,
            cancel,
        }
    }

    /// Run until the source ends, fails, or the token is cancelled.
    ///
    /// Read errors are returned to the owner; the pump never retries.
    pub async fn run(self) -> io::Result<PumpOutcome> {
        let Self {
            source,
            destination,
            config,
            cancel,
        } = self;
        tokio::pin!(source);

        let mut bytes = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(PumpOutcome::Cancelled { bytes }),
                next = source.next() => next,
            };

            let chunk = match next {
                Some(chunk) => chunk?,
                None => return Ok(PumpOutcome::SourceClosed { bytes }),
            };

            if chunk.is_empty() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(PumpOutcome::Cancelled { bytes }),
                    _ = tokio::time::sleep(config.idle_wait) => {}
                }
                continue;
            }

            let len = chunk.len() as u64;
            if !deliver(&destination, chunk, &cancel).await {
                return Ok(PumpOutcome::Cancelled { bytes });
            }
            bytes += len;
            trace!(len, total = bytes, "pumped chunk");
        }
    }
}

/// Hand one chunk to the current sink. Returns false if cancelled first.
///
/// Room is reserved before the chunk is committed. If the destination is
/// rebound while the pump waits for room, or the sink's receiver is gone,
/// the chunk goes to the next binding instead.
async fn deliver(destination: &Destination, chunk: Bytes, cancel: &CancellationToken) -> bool {
    let mut slot = destination.slot.subscribe();
    loop {
        let sink = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            sink = bound_sink(&mut slot) => sink,
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            changed = slot.changed() => {
                if changed.is_err() {
                    return false;
                }
                debug!("destination rebound while waiting for room");
                continue;
            }
            permit = sink.reserve() => permit,
        };

        match permit {
            Ok(permit) => {
                permit.send(chunk);
                return true;
            }
            Err(_) => {
                debug!("destination closed, waiting for a new binding");
                destination.unbind_if(&sink);
            }
        }
    }
}

/// Chunked source over a socket half, reading at most `buffer_size` at a time.
pub fn reader_source<R: AsyncRead>(reader: R, config: &PumpConfig) -> ReaderStream<R> {
    ReaderStream::with_capacity(reader, config.buffer_size)
}

/// Turn the receiving half of a sink into an HTTP body stream.
///
/// Once `cancel` fires the channel is closed, chunks already queued are
/// still yielded, and then the stream ends. Dropping the stream early
/// cancels `cancel`, so the owner learns that the body went away. Chunks
/// the stream never pulled stay queued for the next body over `rx`.
pub fn sink_stream(
    rx: SharedReceiver,
    cancel: CancellationToken,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let guard = cancel.clone().drop_guard();
    futures_util::stream::unfold(
        (rx, cancel, guard, false),
        |(rx, cancel, guard, draining)| async move {
            let (next, draining) = {
                let mut receiver = rx.lock().await;
                if draining {
                    (receiver.recv().await, true)
                } else {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            receiver.close();
                            (receiver.recv().await, true)
                        }
                        chunk = receiver.recv() => (chunk, false),
                    }
                }
            };
            next.map(|chunk| (Ok::<_, io::Error>(chunk), (rx, cancel, guard, draining)))
        },
    )
}

/// Drain a sink into a writer until every sender is gone or `cancel` fires.
///
/// Chunks queued before cancellation are still written, then the writer is
/// shut down.
pub async fn write_sink<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    cancel: CancellationToken,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = rx.recv() => chunk,
        };
        match chunk {
            Some(chunk) => {
                writer.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            None => break,
        }
    }

    rx.close();
    while let Some(chunk) = rx.recv().await {
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    if let Err(e) = writer.shutdown().await {
        debug!("shutdown after drain failed: {}", e);
    }
    Ok(written)
}
