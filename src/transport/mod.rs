//! The seam between the router and whatever owns the socket.
//!
//! A transport delivers each request as a [`RequestHead`](crate::http::RequestHead)
//! plus a [`BodyStream`] it feeds through the paired [`BodySender`], and it
//! receives the response through a [`ResponseSink`]. An [`AbortSignal`] lets
//! it report a dropped connection so the router stops writing.
//!
//! [`MemorySink`] records everything written to it and is what the crate's
//! own tests (and yours) use in place of a socket.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::sync::{Notify, mpsc};

use crate::BoxFuture;
use crate::http::ResponseHead;

/// Receives the response from the lifecycle engine.
///
/// The engine calls [`send_head`](Self::send_head) exactly once, then
/// [`send_chunk`](Self::send_chunk) zero or more times, then
/// [`finish`](Self::finish) exactly once, unless the connection is aborted,
/// in which case it stops calling the sink at all.
///
/// Each future should resolve only once the data has been accepted by the
/// underlying connection; that is how backpressure reaches streaming handlers.
/// An `Err` is treated as a disconnect.
pub trait ResponseSink: Send {
    /// Commits the status line and headers.
    fn send_head(&mut self, head: ResponseHead) -> BoxFuture<'_, io::Result<()>>;

    /// Writes one body chunk.
    fn send_chunk(&mut self, chunk: Bytes) -> BoxFuture<'_, io::Result<()>>;

    /// Ends the response.
    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    notify: Notify,
}

/// Shared flag a transport raises when the peer goes away.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Clone, Default)]
pub struct AbortSignal {
    state: Arc<AbortState>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the connection as gone and wakes every waiter.
    pub fn abort(&self) {
        self.state.aborted.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::Acquire)
    }

    /// Resolves once [`abort`](Self::abort) has been called.
    pub async fn aborted(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Creates a bounded request-body channel.
///
/// The transport pushes chunks into the [`BodySender`]; the router reads them
/// from the [`BodyStream`]. Once `capacity` chunks are queued the sender's
/// `send` waits, which is the transport's cue to stop reading the socket.
pub fn body_channel(capacity: usize) -> (BodySender, BodyStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BodySender { tx: Some(tx) }, BodyStream { rx })
}

/// Transport half of the request-body channel.
#[derive(Debug)]
pub struct BodySender {
    tx: Option<mpsc::Sender<io::Result<Bytes>>>,
}

impl BodySender {
    /// Delivers one chunk. `is_last` closes the body after this chunk.
    ///
    /// Returns `false` when the reader is gone (the handler dropped the body)
    /// or the body was already closed; the transport may then discard the
    /// rest of the body.
    pub async fn send(&mut self, chunk: Bytes, is_last: bool) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let delivered = chunk.is_empty() || tx.send(Ok(chunk)).await.is_ok();
        if is_last || !delivered {
            self.tx = None;
        }
        delivered
    }

    /// Ends the body with an error, e.g. when the connection dropped mid-body.
    pub async fn fail(&mut self, error: io::Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error)).await;
        }
    }

    /// Returns `true` once the last chunk has been pushed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// Router half of the request-body channel.
#[derive(Debug)]
pub struct BodyStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl BodyStream {
    /// A body that has already ended.
    pub fn empty() -> Self {
        let (_, stream) = body_channel(1);
        stream
    }

    /// A body consisting of a single in-memory chunk.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let bytes = bytes.into();
        if !bytes.is_empty() {
            let _ = tx.try_send(Ok(bytes));
        }
        Self { rx }
    }

    /// Waits for the next chunk; `None` once the body has ended.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.rx.recv().await
    }

    /// Reads the whole remaining body into one buffer.
    pub async fn collect(mut self) -> io::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// One call made on a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Head(ResponseHead),
    Chunk(Bytes),
    Finish,
}

/// A [`ResponseSink`] that records every call.
///
/// Clones share the same log, so keep one clone to inspect after handing the
/// other to the router.
///
/// # Examples
///
/// ```
/// use fsrouter::transport::{MemorySink, SinkEvent};
///
/// let sink = MemorySink::new();
/// let probe = sink.clone();
/// // ... hand `sink` to `App::dispatch` ...
/// assert!(probe.events().is_empty());
/// assert!(!probe.is_finished());
/// ```
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call fail with `BrokenPipe`, like a vanished peer.
    pub fn break_pipe(&self) {
        self.fail_writes.store(true, Ordering::Release);
    }

    fn record(&self, event: SinkEvent) -> io::Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }

    /// Every recorded call, in order.
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The committed head, if one was sent.
    pub fn head(&self) -> Option<ResponseHead> {
        self.events().into_iter().find_map(|event| match event {
            SinkEvent::Head(head) => Some(head),
            _ => None,
        })
    }

    /// All body chunks concatenated.
    pub fn body(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for event in self.events() {
            if let SinkEvent::Chunk(chunk) = event {
                buf.extend_from_slice(&chunk);
            }
        }
        buf.freeze()
    }

    /// Number of chunk writes.
    pub fn chunk_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, SinkEvent::Chunk(_)))
            .count()
    }

    pub fn is_finished(&self) -> bool {
        self.events().contains(&SinkEvent::Finish)
    }
}

impl ResponseSink for MemorySink {
    fn send_head(&mut self, head: ResponseHead) -> BoxFuture<'_, io::Result<()>> {
        let result = self.record(SinkEvent::Head(head));
        Box::pin(async move { result })
    }

    fn send_chunk(&mut self, chunk: Bytes) -> BoxFuture<'_, io::Result<()>> {
        let result = self.record(SinkEvent::Chunk(chunk));
        Box::pin(async move { result })
    }

    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
        let result = self.record(SinkEvent::Finish);
        Box::pin(async move { result })
    }
}
