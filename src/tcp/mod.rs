//! TCP dispatch.
//!
//! # Data Flow
//! ```text
//! tracked Connection
//!     → TcpRouter (peek ClientHello)
//!         ├─ TLS + SNI route      → TcpHandler (passthrough proxy)
//!         ├─ TLS, no route        → HTTPS forwarder → embedded HTTPS server
//!         ├─ plain + catch-all    → TcpHandler
//!         └─ plain                → HTTP forwarder → embedded HTTP server
//! ```

pub mod proxy;
pub mod router;

use async_trait::async_trait;

use crate::net::Connection;

pub use proxy::TcpProxy;
pub use router::TcpRouter;

/// Something that takes ownership of an accepted connection.
#[async_trait]
pub trait TcpHandler: Send + Sync {
    async fn serve_tcp(&self, conn: Connection);
}
