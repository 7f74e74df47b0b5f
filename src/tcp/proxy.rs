//! Raw TCP forwarding to a set of backend servers.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;

use crate::load_balancer::RoundRobin;
use crate::net::Connection;
use crate::tcp::TcpHandler;

/// Default time allowed to reach a backend.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Pipes each connection to the next backend in rotation.
#[derive(Debug)]
pub struct TcpProxy {
    servers: RoundRobin<String>,
    dial_timeout: Duration,
}

impl TcpProxy {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers: RoundRobin::new(servers),
            dial_timeout: DIAL_TIMEOUT,
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}

#[async_trait]
impl TcpHandler for TcpProxy {
    async fn serve_tcp(&self, mut conn: Connection) {
        let Some(address) = self.servers.next() else {
            tracing::debug!(connection_id = %conn.id(), "No TCP server available");
            return;
        };

        let connect = TcpStream::connect(address.as_str());
        let mut upstream = match tokio::time::timeout(self.dial_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(
                    connection_id = %conn.id(),
                    server = %address,
                    error = %e,
                    "Failed to reach TCP server"
                );
                return;
            }
            Err(_) => {
                tracing::debug!(
                    connection_id = %conn.id(),
                    server = %address,
                    "Timed out reaching TCP server"
                );
                return;
            }
        };

        match copy_bidirectional(&mut conn, &mut upstream).await {
            Ok((sent, received)) => tracing::trace!(
                connection_id = %conn.id(),
                server = %address,
                sent,
                received,
                "TCP connection finished"
            ),
            Err(e) => tracing::debug!(
                connection_id = %conn.id(),
                server = %address,
                error = %e,
                "TCP connection ended with error"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn pipes_both_directions_including_replayed_bytes() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 10];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(front.local_addr().unwrap()).await.unwrap();
        let (accepted, _) = front.accept().await.unwrap();
        let mut conn = Connection::new(accepted).unwrap();

        client.write_all(b"peek").await.unwrap();
        while conn.buffered().len() < 4 {
            conn.fill().await.unwrap();
        }

        let proxy = TcpProxy::new(vec![backend_addr.to_string()]);
        tokio::spawn(async move { proxy.serve_tcp(conn).await });

        client.write_all(b"-rest!").await.unwrap();
        let mut echoed = [0u8; 10];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"peek-rest!");
    }
}
