//! Entry points and the server that drives them.
//!
//! # Data Flow
//! ```text
//! ConfigurationWatcher ──▶ listener ──▶ RouterFactory::create_routers
//!                                           │
//!                       ┌───────────────────┴──────────────────┐
//!                       ▼                                      ▼
//!          TcpEntryPoint::switch_router          UdpEntryPoint::switch_handler
//!                       │                                      │
//!   accept ─▶ Connection ─▶ TcpRouter          datagram ─▶ UdpConn ─▶ UdpHandler
//!                  ├─▶ TcpHandler (catch-all, SNI passthrough)
//!                  ├─▶ HttpForwarder ─▶ HttpServer "http"
//!                  └─▶ HttpForwarder ─▶ HttpServer "https" (TLS terminated)
//! ```

pub mod entrypoint_tcp;
pub mod entrypoint_udp;
pub mod router_factory;
#[allow(clippy::module_inception)]
pub mod server;

use crate::net::listener::ListenerError;
use crate::net::proxy_protocol::ProxyProtocolError;

pub use entrypoint_tcp::TcpEntryPoint;
pub use entrypoint_udp::UdpEntryPoint;
pub use router_factory::{DefaultRouterFactory, RouterFactory, Routers};
pub use server::Server;

/// Lifecycle of an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPointState {
    Created,
    Running,
    Draining,
    Closed,
}

/// Error type for building and starting the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("entry point {entry_point}: {reason}")]
    Address { entry_point: String, reason: String },

    #[error("entry point {entry_point}: {source}")]
    Bind {
        entry_point: String,
        #[source]
        source: ListenerError,
    },

    #[error("entry point {entry_point}: invalid PROXY protocol settings: {source}")]
    ProxyProtocol {
        entry_point: String,
        #[source]
        source: ProxyProtocolError,
    },
}
