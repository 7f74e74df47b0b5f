//! Session-per-source UDP listener.
//!
//! # Responsibilities
//! - Read datagrams from the shared socket
//! - Route each datagram to the session of its source address, creating
//!   the session on first contact while accepting
//! - Expire sessions after the idle timeout (reads and writes both count)
//! - Stop creating sessions, wait for the live ones, close everything

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::udp::UdpHandlerSwitcher;

/// Largest datagram read from or written to the socket.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Datagrams queued per session before new ones are dropped.
const SESSION_QUEUE: usize = 64;

#[derive(Debug)]
struct Session {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

#[derive(Debug)]
struct Sessions {
    map: DashMap<SocketAddr, Session>,
    next_id: AtomicU64,
    count: watch::Sender<usize>,
}

impl Sessions {
    fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            map: DashMap::new(),
            next_id: AtomicU64::new(0),
            count,
        }
    }

    /// Register a session for `peer` and return its id.
    fn insert(&self, peer: SocketAddr, tx: mpsc::Sender<Vec<u8>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.map.insert(peer, Session { id, tx });
        self.count.send_replace(self.map.len());
        id
    }

    fn remove(&self, peer: &SocketAddr) {
        self.map.remove(peer);
        self.count.send_replace(self.map.len());
    }

    /// Remove `peer` only while it still maps to session `id`.
    fn remove_session(&self, peer: &SocketAddr, id: u64) {
        if self.map.remove_if(peer, |_, session| session.id == id).is_some() {
            self.count.send_replace(self.map.len());
        }
    }

    fn clear(&self) {
        self.map.clear();
        self.count.send_replace(0);
    }
}

/// Owns the socket and the session table of one UDP entry point.
#[derive(Clone)]
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    sessions: Arc<Sessions>,
    timeout: Duration,
    accepting: Arc<AtomicBool>,
    token: CancellationToken,
}

impl UdpListener {
    pub fn new(socket: UdpSocket, timeout: Duration) -> Self {
        Self {
            socket: Arc::new(socket),
            sessions: Arc::new(Sessions::new()),
            timeout,
            accepting: Arc::new(AtomicBool::new(true)),
            token: CancellationToken::new(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.map.len()
    }

    /// Read datagrams until [`close`](Self::close).
    pub async fn run(self, switcher: UdpHandlerSwitcher) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (n, peer) = tokio::select! {
                _ = self.token.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::debug!(error = %e, "UDP receive failed");
                        continue;
                    }
                },
            };
            self.dispatch(peer, &buf[..n], &switcher);
        }

        tracing::debug!("UDP read loop stopped");
    }

    fn dispatch(&self, peer: SocketAddr, datagram: &[u8], switcher: &UdpHandlerSwitcher) {
        if let Some(tx) = self.sessions.map.get(&peer).map(|session| session.tx.clone()) {
            match tx.try_send(datagram.to_vec()) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!(peer_addr = %peer, "UDP session queue full, dropping datagram");
                    return;
                }
                // The session ended between lookup and send; start a new one.
                Err(mpsc::error::TrySendError::Closed(_)) => self.sessions.remove(&peer),
            }
        }

        if !self.accepting.load(Ordering::Acquire) {
            tracing::trace!(peer_addr = %peer, "Not accepting new UDP sessions");
            return;
        }

        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        if tx.try_send(datagram.to_vec()).is_err() {
            return;
        }
        let id = self.sessions.insert(peer, tx);

        let conn = UdpConn {
            id,
            peer,
            rx,
            replier: UdpReplier {
                socket: self.socket.clone(),
                peer,
                last_activity: Arc::new(Mutex::new(Instant::now())),
            },
            timeout: self.timeout,
            sessions: self.sessions.clone(),
        };
        let handler = switcher.current();
        tracing::trace!(peer_addr = %peer, "UDP session started");
        tokio::spawn(async move { handler.serve_udp(conn).await });
    }

    /// Keep serving existing sessions but refuse new sources.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Resolve once no session is live.
    pub async fn wait_idle(&self) {
        let mut rx = self.sessions.count.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Stop reading and end every session.
    pub fn close(&self) {
        self.stop_accepting();
        self.token.cancel();
        self.sessions.clear();
    }
}

/// Sending half of a session, cloneable for reply tasks.
#[derive(Debug, Clone)]
pub struct UdpReplier {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    last_activity: Arc<Mutex<Instant>>,
}

impl UdpReplier {
    pub async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        let len = datagram.len().min(MAX_DATAGRAM_SIZE);
        let sent = self.socket.send_to(&datagram[..len], self.peer).await?;
        self.touch();
        Ok(sent)
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn idle_deadline(&self, timeout: Duration) -> Instant {
        let last = self
            .last_activity
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|_| Instant::now());
        last + timeout
    }
}

/// One UDP session: the datagrams of a single source address.
#[derive(Debug)]
pub struct UdpConn {
    id: u64,
    peer: SocketAddr,
    rx: mpsc::Receiver<Vec<u8>>,
    replier: UdpReplier,
    timeout: Duration,
    sessions: Arc<Sessions>,
}

impl UdpConn {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Next datagram, or `None` once the session is idle or closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            let deadline = self.replier.idle_deadline(self.timeout);
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(datagram)) => {
                    self.replier.touch();
                    return Some(datagram);
                }
                Ok(None) => return None,
                Err(_) => {
                    // A reply may have pushed the deadline back meanwhile.
                    if self.replier.idle_deadline(self.timeout) <= Instant::now() {
                        tracing::trace!(peer_addr = %self.peer, "UDP session expired");
                        return None;
                    }
                }
            }
        }
    }

    pub async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        self.replier.send(datagram).await
    }

    pub fn replier(&self) -> UdpReplier {
        self.replier.clone()
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        // A newer session may own the address by now.
        self.sessions.remove_session(&self.peer, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::udp::UdpHandler;

    struct Echo;

    #[async_trait]
    impl UdpHandler for Echo {
        async fn serve_udp(&self, mut conn: UdpConn) {
            while let Some(datagram) = conn.recv().await {
                let _ = conn.send(&datagram).await;
            }
        }
    }

    async fn echo_listener(timeout: Duration) -> (UdpListener, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = UdpListener::new(socket, timeout);
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.clone().run(UdpHandlerSwitcher::new(Arc::new(Echo))));
        (listener, addr)
    }

    #[tokio::test]
    async fn session_echoes_and_expires() {
        let (listener, addr) = echo_listener(Duration::from_millis(100)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();

        client.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(listener.session_count(), 1);

        tokio::time::timeout(Duration::from_secs(1), listener.wait_idle())
            .await
            .unwrap();
        listener.close();
    }

    #[tokio::test]
    async fn refuses_new_sources_when_not_accepting() {
        let (listener, addr) = echo_listener(Duration::from_secs(5)).await;
        listener.stop_accepting();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"late", addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.session_count(), 0);
        listener.close();
    }

    #[tokio::test]
    async fn ended_session_leaves_newer_session_of_same_peer() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = UdpListener::new(socket, Duration::from_secs(5));
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let (old_tx, old_rx) = mpsc::channel(1);
        let old_id = listener.sessions.insert(peer, old_tx);
        let old = UdpConn {
            id: old_id,
            peer,
            rx: old_rx,
            replier: UdpReplier {
                socket: listener.socket.clone(),
                peer,
                last_activity: Arc::new(Mutex::new(Instant::now())),
            },
            timeout: listener.timeout,
            sessions: listener.sessions.clone(),
        };

        // The peer came back before the old session was dropped.
        let (new_tx, _new_rx) = mpsc::channel(1);
        let new_id = listener.sessions.insert(peer, new_tx);
        assert_ne!(old_id, new_id);

        drop(old);
        assert_eq!(listener.session_count(), 1);
        assert_eq!(listener.sessions.map.get(&peer).unwrap().id, new_id);
    }

    #[tokio::test]
    async fn close_ends_live_sessions() {
        let (listener, addr) = echo_listener(Duration::from_secs(60)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hi", addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.session_count(), 1);

        listener.close();
        tokio::time::timeout(Duration::from_millis(500), listener.wait_idle())
            .await
            .unwrap();
    }
}
