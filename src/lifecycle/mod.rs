//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger → Server::stop
//!     SIGUSR1        → LogHandle::reopen
//!
//! Shutdown (shutdown.rs):
//!     root token cancelled → entry points drain → watcher stops
//! ```
//!
//! # Design Decisions
//! - One root cancellation token; every long-running task holds a child
//! - Log rotation never touches traffic

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
