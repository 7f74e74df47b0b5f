//! Dynamic-configuration reverse-proxy core.
//!
//! Providers feed configuration fragments to a watcher that throttles,
//! merges and publishes them. A router factory turns each merged
//! configuration into routers that TCP and UDP entry points swap in
//! atomically, without dropping live connections.

// Configuration
pub mod config;
pub mod provider;
pub mod watcher;

// Traffic
pub mod http;
pub mod load_balancer;
pub mod net;
pub mod server;
pub mod tcp;
pub mod udp;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::{Configuration, StaticConfig};
pub use lifecycle::Shutdown;
pub use server::{DefaultRouterFactory, RouterFactory, Server};
pub use watcher::ConfigurationWatcher;
