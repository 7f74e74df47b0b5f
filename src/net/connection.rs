//! Tracked connections.
//!
//! # Responsibilities
//! - Wrap every accepted TCP stream with a unique ID and its addresses
//! - Replay bytes that were read ahead (PROXY header leftovers, peeked
//!   ClientHello) before reading from the socket again
//! - Register the stream with a [`ConnectionTracker`] for its whole lifetime,
//!   whoever ends up owning it (HTTP server, TLS stream, TCP proxy)
//! - Let the tracker force-close every live stream at the drain deadline
//!
//! # Design Decisions
//! - Tracking lives on the raw stream, so upgraded HTTP connections stay
//!   tracked after hyper hands them off
//! - Force-close makes pending and future I/O fail with `ConnectionAborted`;
//!   the owner then drops the stream, which closes the socket

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::task::AtomicWaker;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Bytes read per [`Connection::fill`] call.
const FILL_CHUNK: usize = 4096;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Shared between a connection and its tracker entry.
#[derive(Debug, Default)]
struct CloseSignal {
    closed: AtomicBool,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
}

impl CloseSignal {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.read_waker.wake();
        self.write_waker.wake();
    }

    fn poll_closed(&self, waker: &AtomicWaker, cx: &Context<'_>) -> bool {
        waker.register(cx.waker());
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct TrackerInner {
    conns: Mutex<HashMap<ConnectionId, Arc<CloseSignal>>>,
    count: watch::Sender<usize>,
}

/// Set of live connections of one entry point.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(TrackerInner {
                conns: Mutex::new(HashMap::new()),
                count,
            }),
        }
    }

    fn add(&self, id: ConnectionId, signal: Arc<CloseSignal>) {
        let mut conns = self.lock();
        conns.insert(id, signal);
        self.inner.count.send_replace(conns.len());
    }

    fn remove(&self, id: ConnectionId) {
        let mut conns = self.lock();
        if conns.remove(&id).is_some() {
            self.inner.count.send_replace(conns.len());
            tracing::trace!(connection_id = %id, "Connection closed");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<CloseSignal>>> {
        // A panic while holding the lock leaves the map consistent.
        self.inner
            .conns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Abort every live connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let conns = self.lock();
        for signal in conns.values() {
            signal.close();
        }
        conns.len()
    }

    /// Resolve once no connection is tracked.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.count.subscribe();
        // The sender lives in `self`, so this can only fail if it is dropped.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// An accepted TCP stream with read-ahead replay and lifetime tracking.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    buffer: Vec<u8>,
    pos: usize,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    id: ConnectionId,
    signal: Arc<CloseSignal>,
    tracker: Option<ConnectionTracker>,
}

impl Connection {
    /// Wrap `stream` and register it with `tracker` until dropped.
    pub fn tracked(stream: TcpStream, tracker: &ConnectionTracker) -> io::Result<Self> {
        let mut conn = Self::new(stream)?;
        tracker.add(conn.id, conn.signal.clone());
        conn.tracker = Some(tracker.clone());
        Ok(conn)
    }

    /// Wrap `stream` without tracking.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        Ok(Self {
            stream,
            buffer: Vec::new(),
            pos: 0,
            peer_addr,
            local_addr,
            id: ConnectionId::new(),
            signal: Arc::new(CloseSignal::default()),
            tracker: None,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Client address, as reported by the PROXY header when one was accepted.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer_addr = addr;
    }

    /// Bytes read ahead and not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.pos..]
    }

    /// Drop `n` read-ahead bytes so they are never replayed.
    pub fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buffer.len());
        if self.pos == self.buffer.len() {
            self.buffer.clear();
            self.pos = 0;
        }
    }

    /// Read more bytes from the socket into the replay buffer.
    ///
    /// Returns the number of bytes added; zero means EOF.
    pub async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; FILL_CHUNK];
        let mut buf = ReadBuf::new(&mut chunk);
        std::future::poll_fn(|cx| {
            if self.signal.poll_closed(&self.signal.read_waker, cx) {
                return Poll::Ready(Err(aborted()));
            }
            Pin::new(&mut self.stream).poll_read(cx, &mut buf)
        })
        .await?;
        let n = buf.filled().len();
        self.buffer.extend_from_slice(buf.filled());
        Ok(n)
    }

    pub fn is_closed(&self) -> bool {
        self.signal.closed.load(Ordering::Acquire)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.remove(self.id);
        }
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by server")
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.signal.poll_closed(&this.signal.read_waker, cx) {
            return Poll::Ready(Err(aborted()));
        }

        let pending = this.buffered();
        if !pending.is_empty() {
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..n]);
            this.consume(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.signal.poll_closed(&this.signal.write_waker, cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.signal.poll_closed(&this.signal.write_waker, cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.signal.poll_closed(&this.signal.write_waker, cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}
