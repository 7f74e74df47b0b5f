//! In-process handoff from the protocol router to an embedded HTTP server.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::ServerConfig;
use tokio::sync::mpsc;

use crate::net::Connection;
use crate::tcp::TcpHandler;

/// A connection queued for an embedded HTTP server.
pub struct Incoming {
    pub conn: Connection,
    /// Terminate TLS with this configuration before serving HTTP.
    pub tls: Option<Arc<ServerConfig>>,
}

/// Sending half of an embedded server's queue.
#[derive(Clone)]
pub struct HttpForwarder {
    tx: mpsc::Sender<Incoming>,
    tls: Option<Arc<ServerConfig>>,
}

impl HttpForwarder {
    pub(crate) fn new(tx: mpsc::Sender<Incoming>) -> Self {
        Self { tx, tls: None }
    }

    /// Same queue, terminating TLS with `tls`.
    pub fn with_tls(&self, tls: Arc<ServerConfig>) -> Self {
        Self {
            tx: self.tx.clone(),
            tls: Some(tls),
        }
    }

    pub fn terminates_tls(&self) -> bool {
        self.tls.is_some()
    }
}

#[async_trait]
impl TcpHandler for HttpForwarder {
    async fn serve_tcp(&self, conn: Connection) {
        let id = conn.id();
        let incoming = Incoming {
            conn,
            tls: self.tls.clone(),
        };
        if self.tx.send(incoming).await.is_err() {
            tracing::debug!(connection_id = %id, "HTTP server stopped, dropping connection");
        }
    }
}
