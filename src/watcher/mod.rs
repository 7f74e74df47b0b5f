//! Dynamic configuration pipeline.
//!
//! # Responsibilities
//! - Receive provider messages and drop empty or repeated ones
//! - Throttle each provider independently
//! - Merge every provider's configuration into one namespaced view
//! - Notify listeners (the server) with the merged result

pub mod merge;
pub mod model;
pub mod throttle;
#[allow(clippy::module_inception)]
pub mod watcher;

pub use merge::merge_configuration;
pub use watcher::{ConfigListener, ConfigurationWatcher};
