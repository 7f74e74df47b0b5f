//! Observability subsystem.
//!
//! Logging only: structured `tracing` events everywhere, one subscriber
//! installed at startup, a log file that can be reopened for rotation.

pub mod logging;

pub use logging::{init_logging, LogHandle, LoggingError};
