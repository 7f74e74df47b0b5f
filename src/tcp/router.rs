//! Protocol router of a TCP entry point.
//!
//! One router is active per entry point. It owns everything needed to place
//! a connection: SNI routes, a plain-TCP catch-all, the HTTP and HTTPS
//! handlers for the embedded servers, and the forwarders into them. A new
//! router is assembled completely and only then swapped in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::ServerConfig;

use crate::http::forwarder::HttpForwarder;
use crate::net::clienthello::{peek_client_hello, ClientHello};
use crate::net::Connection;
use crate::tcp::TcpHandler;

/// SNI route key matching any server name.
pub const ANY_SNI: &str = "*";

/// Default time to wait for a ClientHello.
pub const DEFAULT_CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(2);

/// Where a connection goes after inspection.
#[derive(Clone)]
pub enum Route {
    Tcp(Arc<dyn TcpHandler>),
    Http(HttpForwarder),
    Https(HttpForwarder),
    Close,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Tcp(_) => f.write_str("Tcp"),
            Route::Http(_) => f.write_str("Http"),
            Route::Https(_) => f.write_str("Https"),
            Route::Close => f.write_str("Close"),
        }
    }
}

#[derive(Default)]
pub struct TcpRouter {
    sni_routes: HashMap<String, Arc<dyn TcpHandler>>,
    catch_all: Option<Arc<dyn TcpHandler>>,
    http_handler: Option<axum::Router>,
    https_handler: Option<axum::Router>,
    tls_config: Option<Arc<ServerConfig>>,
    http_forwarder: Option<HttpForwarder>,
    https_forwarder: Option<HttpForwarder>,
    client_hello_timeout: Option<Duration>,
}

impl TcpRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route TLS connections for `server_name` (or [`ANY_SNI`]) to `handler`
    /// without terminating TLS.
    pub fn add_sni_route(&mut self, server_name: &str, handler: Arc<dyn TcpHandler>) {
        let key = server_name.trim_end_matches('.').to_ascii_lowercase();
        if self.sni_routes.insert(key, handler).is_some() {
            tracing::debug!(server_name = %server_name, "SNI route replaced");
        }
    }

    /// Handler for every non-TLS connection.
    pub fn set_catch_all(&mut self, handler: Arc<dyn TcpHandler>) {
        self.catch_all = Some(handler);
    }

    pub fn set_http_handler(&mut self, handler: axum::Router) {
        self.http_handler = Some(handler);
    }

    pub fn set_https_handler(&mut self, handler: axum::Router) {
        self.https_handler = Some(handler);
    }

    /// TLS termination for connections no SNI route claims.
    pub fn set_tls_config(&mut self, config: Arc<ServerConfig>) {
        self.tls_config = Some(config);
    }

    pub fn set_client_hello_timeout(&mut self, timeout: Duration) {
        self.client_hello_timeout = Some(timeout);
    }

    pub fn http_handler(&self) -> Option<&axum::Router> {
        self.http_handler.as_ref()
    }

    /// HTTPS handler, defaulting to the HTTP one.
    pub fn https_handler(&self) -> Option<&axum::Router> {
        self.https_handler.as_ref().or(self.http_handler.as_ref())
    }

    pub fn tls_config(&self) -> Option<&Arc<ServerConfig>> {
        self.tls_config.as_ref()
    }

    /// Wire the embedded servers' queues. Called by the entry point before
    /// the router goes live.
    pub fn set_forwarders(&mut self, http: HttpForwarder, https: HttpForwarder) {
        self.http_forwarder = Some(http);
        self.https_forwarder = self.tls_config.as_ref().map(|tls| https.with_tls(tls.clone()));
    }

    pub(crate) fn client_hello_timeout_or(&mut self, timeout: Duration) {
        self.client_hello_timeout.get_or_insert(timeout);
    }

    /// A lone catch-all needs no inspection: server-speaks-first protocols
    /// would otherwise stall for the peek timeout.
    fn needs_peek(&self) -> bool {
        !(self.catch_all.is_some() && self.sni_routes.is_empty() && self.tls_config.is_none())
    }

    /// Pick the destination of a connection from what its first bytes said.
    pub fn select(&self, hello: &ClientHello) -> Route {
        if !hello.is_tls {
            if let Some(handler) = &self.catch_all {
                return Route::Tcp(handler.clone());
            }
            return match &self.http_forwarder {
                Some(forwarder) => Route::Http(forwarder.clone()),
                None => Route::Close,
            };
        }

        let by_name = hello
            .server_name
            .as_deref()
            .and_then(|name| self.sni_routes.get(name));
        if let Some(handler) = by_name.or_else(|| self.sni_routes.get(ANY_SNI)) {
            return Route::Tcp(handler.clone());
        }

        match &self.https_forwarder {
            Some(forwarder) => Route::Https(forwarder.clone()),
            None => Route::Close,
        }
    }
}

#[async_trait]
impl TcpHandler for TcpRouter {
    async fn serve_tcp(&self, mut conn: Connection) {
        if !self.needs_peek() {
            if let Some(handler) = &self.catch_all {
                handler.serve_tcp(conn).await;
            }
            return;
        }

        let timeout = self
            .client_hello_timeout
            .unwrap_or(DEFAULT_CLIENT_HELLO_TIMEOUT);
        let hello = match peek_client_hello(&mut conn, timeout).await {
            Ok(hello) => hello,
            Err(e) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "Failed to read first bytes");
                return;
            }
        };

        match self.select(&hello) {
            Route::Tcp(handler) => handler.serve_tcp(conn).await,
            Route::Http(forwarder) | Route::Https(forwarder) => forwarder.serve_tcp(conn).await,
            Route::Close => tracing::debug!(
                connection_id = %conn.id(),
                server_name = ?hello.server_name,
                "No route for TLS connection, closing"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::server::HttpServer;

    struct Named;

    #[async_trait]
    impl TcpHandler for Named {
        async fn serve_tcp(&self, _conn: Connection) {}
    }

    fn tls(name: Option<&str>) -> ClientHello {
        ClientHello {
            is_tls: true,
            server_name: name.map(str::to_string),
            alpn: Vec::new(),
        }
    }

    fn tls_config() -> Arc<ServerConfig> {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = rustls::pki_types::PrivatePkcs8KeyDer::from(key_pair.serialize_der());
        Arc::new(
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_no_client_auth()
                .with_single_cert(vec![cert.der().clone()], key.into())
                .unwrap(),
        )
    }

    #[test]
    fn plain_goes_to_catch_all_then_http() {
        let server = HttpServer::new("test");
        let mut router = TcpRouter::new();
        router.set_forwarders(server.forwarder(), server.forwarder());
        assert!(matches!(router.select(&ClientHello::default()), Route::Http(_)));

        router.set_catch_all(Arc::new(Named));
        assert!(matches!(router.select(&ClientHello::default()), Route::Tcp(_)));
    }

    #[test]
    fn tls_prefers_exact_sni_then_wildcard() {
        let mut router = TcpRouter::new();
        let exact: Arc<dyn TcpHandler> = Arc::new(Named);
        let any: Arc<dyn TcpHandler> = Arc::new(Named);
        router.add_sni_route("DB.example.com.", exact.clone());
        router.add_sni_route(ANY_SNI, any.clone());

        let Route::Tcp(h) = router.select(&tls(Some("db.example.com"))) else {
            panic!("expected TCP route");
        };
        assert!(Arc::ptr_eq(&h, &exact));

        let Route::Tcp(h) = router.select(&tls(Some("other"))) else {
            panic!("expected TCP route");
        };
        assert!(Arc::ptr_eq(&h, &any));
    }

    #[test]
    fn tls_without_route_or_certificate_is_closed() {
        let server = HttpServer::new("test");
        let mut router = TcpRouter::new();
        router.set_forwarders(server.forwarder(), server.forwarder());
        assert!(matches!(router.select(&tls(Some("x"))), Route::Close));
    }

    #[test]
    fn tls_with_certificate_goes_to_https() {
        let server = HttpServer::new("test");
        let mut router = TcpRouter::new();
        router.set_tls_config(tls_config());
        router.set_forwarders(server.forwarder(), server.forwarder());
        let Route::Https(forwarder) = router.select(&tls(None)) else {
            panic!("expected HTTPS route");
        };
        assert!(forwarder.terminates_tls());
    }

    #[test]
    fn lone_catch_all_skips_peek() {
        let mut router = TcpRouter::new();
        router.set_catch_all(Arc::new(Named));
        assert!(!router.needs_peek());
        router.add_sni_route("a", Arc::new(Named));
        assert!(router.needs_peek());
    }
}
