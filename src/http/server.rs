//! Embedded HTTP server fed by a forwarder.
//!
//! # Responsibilities
//! - Serve HTTP/1.1 and HTTP/2 (h2c or over TLS) on forwarded connections
//! - Terminate TLS when the forwarder asks for it
//! - Dispatch every request to the current handler, swappable at runtime
//! - Drain gracefully: idle connections close, in-flight requests finish
//!
//! # Design Decisions
//! - No listener of its own; connections arrive through [`HttpForwarder`]
//! - Upgrades are enabled, the upgraded stream keeps its tracked connection
//! - The client address reaches handlers as `ConnectInfo<SocketAddr>`

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use axum::extract::ConnectInfo;
use axum::response::Response;
use axum::Router;
use hyper::body::Incoming as IncomingBody;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::{GracefulShutdown, Watcher};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::http::forwarder::{HttpForwarder, Incoming};
use crate::http::response::not_found_router;

/// Connections waiting for the server loop.
const FORWARD_QUEUE: usize = 128;

/// Atomically swappable request handler.
#[derive(Clone)]
pub struct HandlerSwitcher {
    current: Arc<ArcSwap<Router>>,
}

impl HandlerSwitcher {
    pub fn new(handler: Router) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(handler)),
        }
    }

    pub fn switch(&self, handler: Router) {
        self.current.store(Arc::new(handler));
    }

    pub fn current(&self) -> Arc<Router> {
        self.current.load_full()
    }
}

/// HTTP server serving connections handed over in-process.
pub struct HttpServer {
    name: String,
    switcher: HandlerSwitcher,
    tx: mpsc::Sender<Incoming>,
    rx: Mutex<Option<mpsc::Receiver<Incoming>>>,
    token: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HttpServer {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(FORWARD_QUEUE);
        Self {
            name: name.into(),
            switcher: HandlerSwitcher::new(not_found_router()),
            tx,
            rx: Mutex::new(Some(rx)),
            token: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Forwarder feeding this server.
    pub fn forwarder(&self) -> HttpForwarder {
        HttpForwarder::new(self.tx.clone())
    }

    pub fn switch_handler(&self, handler: Router) {
        self.switcher.switch(handler);
    }

    /// Start the serve loop. Only the first call has an effect.
    pub fn start(&self) {
        let Some(rx) = self.rx.lock().ok().and_then(|mut rx| rx.take()) else {
            return;
        };
        let task = tokio::spawn(serve(
            self.name.clone(),
            rx,
            self.switcher.clone(),
            self.token.clone(),
        ));
        if let Ok(mut slot) = self.task.try_lock() {
            *slot = Some(task);
        }
    }

    /// Stop taking connections and wait for the served ones to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        // Awaited in place so a caller that gives up can call again.
        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_mut() {
            if let Err(e) = handle.await {
                tracing::error!(server = %self.name, error = %e, "HTTP server task failed");
            }
            *task = None;
        }
    }
}

async fn serve(
    name: String,
    mut rx: mpsc::Receiver<Incoming>,
    switcher: HandlerSwitcher,
    token: CancellationToken,
) {
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            incoming = rx.recv() => match incoming {
                Some(incoming) => {
                    tokio::spawn(serve_incoming(incoming, switcher.clone(), graceful.watcher()));
                }
                None => break,
            },
        }
    }

    // Connections still queued were never served; dropping them closes them.
    rx.close();
    while rx.try_recv().is_ok() {}

    tracing::debug!(server = %name, "Waiting for HTTP connections to drain");
    graceful.shutdown().await;
    tracing::debug!(server = %name, "HTTP server stopped");
}

async fn serve_incoming(incoming: Incoming, switcher: HandlerSwitcher, watcher: Watcher) {
    let Incoming { conn, tls } = incoming;
    let id = conn.id();
    let peer_addr = conn.peer_addr();

    match tls {
        Some(config) => match TlsAcceptor::from(config).accept(conn).await {
            Ok(stream) => serve_connection(stream, peer_addr, switcher, watcher).await,
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "TLS handshake failed");
            }
        },
        None => serve_connection(conn, peer_addr, switcher, watcher).await,
    }
}

async fn serve_connection<S>(
    stream: S,
    peer_addr: SocketAddr,
    switcher: HandlerSwitcher,
    watcher: Watcher,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |mut req: Request<IncomingBody>| {
        let handler = switcher.current();
        req.extensions_mut().insert(ConnectInfo(peer_addr));
        async move {
            let response: Result<Response, Infallible> =
                Router::clone(&handler).oneshot(req).await;
            response
        }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    if let Err(e) = watcher.watch(conn).await {
        tracing::debug!(peer_addr = %peer_addr, error = %e, "HTTP connection error");
    }
}
