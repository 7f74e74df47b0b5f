//! TCP entry point.
//!
//! # Responsibilities
//! - Own the listening socket and accept connections
//! - Unwrap PROXY protocol headers when configured
//! - Hand every connection to the current [`TcpRouter`]
//! - Run the embedded HTTP and HTTPS servers the router forwards to
//! - Drain on shutdown: accept grace, then wait for connections up to the
//!   grace deadline, then force-close
//!
//! # Design Decisions
//! - The router is swapped whole; a connection keeps the router it was
//!   dispatched with
//! - Every connection, upgraded ones included, is tracked until its stream
//!   is dropped

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::schema::{EntryPointConfig, LifeCycleConfig, Protocol};
use crate::http::response::not_found_router;
use crate::http::server::HttpServer;
use crate::net::listener::{bind_tcp, ListenerError, SocketOptions};
use crate::net::proxy_protocol::ProxyProtocolPolicy;
use crate::net::{Connection, ConnectionTracker};
use crate::server::{EntryPointState, ServerError};
use crate::tcp::{TcpHandler, TcpRouter};

/// Pause after a failed accept, so fd exhaustion does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// How long force-closed connections get to unwind past the deadline. Their
/// reads and writes fail at once, so this only covers task scheduling.
const FORCE_CLOSE_WAIT: Duration = Duration::from_millis(100);

pub struct TcpEntryPoint {
    name: String,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    proxy_protocol: Option<Arc<ProxyProtocolPolicy>>,
    life_cycle: LifeCycleConfig,
    client_hello_timeout: Duration,
    router: Arc<ArcSwap<TcpRouter>>,
    http: HttpServer,
    https: HttpServer,
    tracker: ConnectionTracker,
    state: watch::Sender<EntryPointState>,
    token: CancellationToken,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TcpEntryPoint {
    /// Bind the listener. Traffic flows only after [`start`](Self::start).
    pub fn bind(name: impl Into<String>, config: &EntryPointConfig) -> Result<Self, ServerError> {
        let name = name.into();
        let (address, protocol) = config
            .parse_address()
            .map_err(|reason| ServerError::Address {
                entry_point: name.clone(),
                reason,
            })?;
        if protocol != Protocol::Tcp {
            return Err(ServerError::Address {
                entry_point: name,
                reason: "not a TCP address".to_string(),
            });
        }

        let proxy_protocol = config
            .proxy_protocol
            .as_ref()
            .map(ProxyProtocolPolicy::from_config)
            .transpose()
            .map_err(|source| ServerError::ProxyProtocol {
                entry_point: name.clone(),
                source,
            })?
            .map(Arc::new);

        let options = SocketOptions {
            reuse_port: config.reuse_port,
            keep_alive: config.keep_alive,
        };
        let bind_err = |source| ServerError::Bind {
            entry_point: name.clone(),
            source,
        };
        let listener = bind_tcp(address, options).map_err(bind_err)?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| bind_err(ListenerError::Bind { address, source }))?;

        let entry_point = Self {
            http: HttpServer::new(format!("{}-http", name)),
            https: HttpServer::new(format!("{}-https", name)),
            name,
            local_addr,
            listener: Mutex::new(Some(listener)),
            proxy_protocol,
            life_cycle: config.transport.life_cycle.clone(),
            client_hello_timeout: config.transport.client_hello_timeout,
            router: Arc::new(ArcSwap::from_pointee(TcpRouter::new())),
            tracker: ConnectionTracker::new(),
            state: watch::Sender::new(EntryPointState::Created),
            token: CancellationToken::new(),
            accept_task: tokio::sync::Mutex::new(None),
        };
        entry_point.switch_router(default_router());
        Ok(entry_point)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> EntryPointState {
        *self.state.borrow()
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.active_count()
    }

    /// Wire `router` to this entry point and make it current.
    ///
    /// The router is completed before the swap: forwarders, peek timeout,
    /// and the embedded servers' handlers.
    pub fn switch_router(&self, mut router: TcpRouter) {
        router.set_forwarders(self.http.forwarder(), self.https.forwarder());
        router.client_hello_timeout_or(self.client_hello_timeout);

        self.http.switch_handler(
            router
                .http_handler()
                .cloned()
                .unwrap_or_else(not_found_router),
        );
        self.https.switch_handler(
            router
                .https_handler()
                .cloned()
                .unwrap_or_else(not_found_router),
        );

        self.router.store(Arc::new(router));
        tracing::debug!(entry_point = %self.name, "Router switched");
    }

    /// Start accepting. Only the first call has an effect.
    pub fn start(&self) {
        let Some(listener) = self.listener.lock().ok().and_then(|mut l| l.take()) else {
            return;
        };

        self.http.start();
        self.https.start();

        let task = tokio::spawn(accept_loop(
            self.name.clone(),
            listener,
            self.router.clone(),
            self.proxy_protocol.clone(),
            self.tracker.clone(),
            self.token.clone(),
        ));
        if let Ok(mut slot) = self.accept_task.try_lock() {
            *slot = Some(task);
        }

        self.state.send_replace(EntryPointState::Running);
        tracing::info!(entry_point = %self.name, address = %self.local_addr, "Entry point started");
    }

    /// Drain and close.
    pub async fn shutdown(&self) {
        let proceed = self.state.send_if_modified(|state| match state {
            EntryPointState::Created | EntryPointState::Running => {
                *state = EntryPointState::Draining;
                true
            }
            EntryPointState::Draining | EntryPointState::Closed => false,
        });
        if !proceed {
            return;
        }

        let accept_grace = self.life_cycle.request_accept_grace_timeout;
        if !accept_grace.is_zero() {
            tracing::info!(
                entry_point = %self.name,
                timeout_ms = accept_grace.as_millis() as u64,
                "Still accepting connections during accept grace"
            );
            tokio::time::sleep(accept_grace).await;
        }

        self.token.cancel();
        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!(entry_point = %self.name, error = %e, "Accept loop failed");
            }
        }
        // A listener that never started is closed here.
        drop(self.listener.lock().ok().and_then(|mut l| l.take()));

        let grace = self.life_cycle.grace_timeout;
        let drain = async {
            tokio::join!(
                self.http.shutdown(),
                self.https.shutdown(),
                self.tracker.wait_idle()
            );
        };

        let drained = !grace.is_zero() && tokio::time::timeout(grace, drain).await.is_ok();
        if drained {
            tracing::debug!(entry_point = %self.name, "Connections drained");
        } else {
            let closed = self.tracker.close_all();
            if closed > 0 {
                tracing::warn!(
                    entry_point = %self.name,
                    connections = closed,
                    grace_ms = grace.as_millis() as u64,
                    "Grace timeout exceeded, closing remaining connections"
                );
            }
            let unwind = async {
                tokio::join!(
                    self.http.shutdown(),
                    self.https.shutdown(),
                    self.tracker.wait_idle()
                );
            };
            if tokio::time::timeout(FORCE_CLOSE_WAIT, unwind).await.is_err() {
                tracing::warn!(entry_point = %self.name, "Connections still unwinding after force close");
            }
        }

        self.state.send_replace(EntryPointState::Closed);
        tracing::info!(entry_point = %self.name, "Entry point closed");
    }
}

/// Router of an entry point no configuration targets: 404 over HTTP, no
/// TLS, no TCP routes.
pub fn default_router() -> TcpRouter {
    let mut router = TcpRouter::new();
    router.set_http_handler(not_found_router());
    router
}

async fn accept_loop(
    name: String,
    listener: TcpListener,
    router: Arc<ArcSwap<TcpRouter>>,
    proxy_protocol: Option<Arc<ProxyProtocolPolicy>>,
    tracker: ConnectionTracker,
    token: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::error!(entry_point = %name, error = %ListenerError::Accept(e), "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        let mut conn = match Connection::tracked(stream, &tracker) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(entry_point = %name, error = %e, "Dropping connection without addresses");
                continue;
            }
        };
        tracing::trace!(
            entry_point = %name,
            connection_id = %conn.id(),
            peer_addr = %conn.peer_addr(),
            "Connection accepted"
        );

        let router = router.clone();
        let proxy_protocol = proxy_protocol.clone();
        tokio::spawn(async move {
            if let Some(policy) = proxy_protocol {
                if let Err(e) = policy.unwrap(&mut conn).await {
                    tracing::debug!(connection_id = %conn.id(), error = %e, "Invalid PROXY header, closing");
                    return;
                }
            }
            let router = router.load_full();
            router.serve_tcp(conn).await;
        });
    }

    tracing::debug!(entry_point = %name, "Accept loop stopped");
}
