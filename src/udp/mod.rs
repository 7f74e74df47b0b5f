//! UDP sessions.
//!
//! UDP has no connections, so the listener makes sessions: datagrams from
//! one source address form one [`UdpConn`], handed to the current
//! [`UdpHandler`] when its first datagram arrives and ended after the idle
//! timeout.

pub mod listener;
pub mod proxy;

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;

pub use listener::{UdpConn, UdpListener, UdpReplier, MAX_DATAGRAM_SIZE};
pub use proxy::UdpProxy;

/// Takes ownership of a UDP session.
#[async_trait]
pub trait UdpHandler: Send + Sync {
    async fn serve_udp(&self, conn: UdpConn);
}

/// Swallows every datagram of a session until it expires.
#[derive(Debug, Default)]
pub struct DropHandler;

#[async_trait]
impl UdpHandler for DropHandler {
    async fn serve_udp(&self, mut conn: UdpConn) {
        tracing::debug!(peer_addr = %conn.peer_addr(), "No UDP router, dropping datagrams");
        while conn.recv().await.is_some() {}
    }
}

/// Atomically swappable UDP handler. New sessions use the handler current
/// at their first datagram.
#[derive(Clone)]
pub struct UdpHandlerSwitcher {
    current: Arc<ArcSwap<Arc<dyn UdpHandler>>>,
}

impl UdpHandlerSwitcher {
    pub fn new(handler: Arc<dyn UdpHandler>) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(handler)),
        }
    }

    pub fn switch(&self, handler: Arc<dyn UdpHandler>) {
        self.current.store(Arc::new(handler));
    }

    pub fn current(&self) -> Arc<dyn UdpHandler> {
        (**self.current.load()).clone()
    }
}

impl Default for UdpHandlerSwitcher {
    fn default() -> Self {
        Self::new(Arc::new(DropHandler))
    }
}
