//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bound with reuse_port / keep-alive)
//!     → connection.rs (tracked Connection with replay buffer)
//!     → proxy_protocol.rs (optional PROXY header unwrapping)
//!     → clienthello.rs (peek: TLS? SNI? ALPN?)
//!     → protocol router (tcp/, http/)
//! ```
//!
//! # Design Decisions
//! - Each connection is tracked for graceful shutdown, including after an
//!   HTTP upgrade
//! - Read-ahead bytes are replayed, so inspection never loses data
//! - TLS termination for HTTP happens in the embedded HTTPS server (tls.rs)

pub mod clienthello;
pub mod connection;
pub mod listener;
pub mod proxy_protocol;
pub mod tls;

pub use connection::{Connection, ConnectionId, ConnectionTracker};
