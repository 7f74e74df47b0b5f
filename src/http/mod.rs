//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TcpRouter
//!     → forwarder.rs (queue the connection, optionally with a TLS config)
//!     → server.rs (TLS termination, hyper HTTP/1.1 + HTTP/2)
//!     → current axum::Router (swappable)
//!     → response.rs (built-in 404)
//! ```

pub mod forwarder;
pub mod response;
pub mod server;

pub use forwarder::HttpForwarder;
pub use server::{HandlerSwitcher, HttpServer};
