//! UDP forwarding to a set of backend servers.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::load_balancer::RoundRobin;
use crate::udp::{UdpConn, UdpHandler, MAX_DATAGRAM_SIZE};

/// Relays each session through its own socket to the next backend in rotation.
#[derive(Debug)]
pub struct UdpProxy {
    servers: RoundRobin<String>,
}

impl UdpProxy {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers: RoundRobin::new(servers),
        }
    }

    async fn dial(address: &str) -> std::io::Result<UdpSocket> {
        let remote = tokio::net::lookup_host(address)
            .await?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))?;
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(socket)
    }
}

#[async_trait]
impl UdpHandler for UdpProxy {
    async fn serve_udp(&self, mut conn: UdpConn) {
        let peer = conn.peer_addr();
        let Some(address) = self.servers.next() else {
            tracing::debug!(peer_addr = %peer, "No UDP server available");
            return;
        };

        let upstream = match Self::dial(address).await {
            Ok(socket) => std::sync::Arc::new(socket),
            Err(e) => {
                tracing::debug!(peer_addr = %peer, server = %address, error = %e, "Failed to reach UDP server");
                return;
            }
        };

        let replier = conn.replier();
        let backend = upstream.clone();
        let replies = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let n = match backend.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(error = %e, "UDP server receive failed");
                        break;
                    }
                };
                if let Err(e) = replier.send(&buf[..n]).await {
                    tracing::debug!(error = %e, "UDP reply to client failed");
                    break;
                }
            }
        });

        while let Some(datagram) = conn.recv().await {
            if let Err(e) = upstream.send(&datagram).await {
                tracing::debug!(peer_addr = %peer, server = %address, error = %e, "UDP send to server failed");
                break;
            }
        }

        replies.abort();
        tracing::trace!(peer_addr = %peer, server = %address, "UDP session finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::udp::{UdpHandlerSwitcher, UdpListener};

    #[tokio::test]
    async fn relays_datagrams_both_ways() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let (n, from) = backend.recv_from(&mut buf).await.unwrap();
                let mut reply = b"echo:".to_vec();
                reply.extend_from_slice(&buf[..n]);
                backend.send_to(&reply, from).await.unwrap();
            }
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = UdpListener::new(socket, Duration::from_secs(5));
        let front = listener.local_addr().unwrap();
        let proxy: Arc<dyn UdpHandler> = Arc::new(UdpProxy::new(vec![backend_addr.to_string()]));
        tokio::spawn(listener.clone().run(UdpHandlerSwitcher::new(proxy)));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(front).await.unwrap();
        let mut buf = [0u8; 64];
        for msg in [&b"one"[..], &b"two"[..]] {
            client.send(msg).await.unwrap();
            let n = tokio::time::timeout(Duration::from_secs(1), client.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..5], b"echo:");
            assert_eq!(&buf[5..n], msg);
        }
        assert_eq!(listener.session_count(), 1);
        listener.close();
    }
}
