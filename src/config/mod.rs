//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! static config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → StaticConfig (entry points, providers, logging)
//!
//! dynamic configuration (per provider)
//!     → dynamic.rs types carried in a Message
//!     → watcher merges them into one Configuration
//!     → router factory → entry points
//! ```
//!
//! # Design Decisions
//! - Static config is immutable once loaded; changes require a restart
//! - Dynamic config is replaced wholesale per provider, never patched
//! - All fields have defaults to allow minimal configs

pub mod duration;
pub mod dynamic;
pub mod loader;
pub mod schema;
pub mod validation;

pub use dynamic::{Configuration, Configurations, Message};
pub use schema::{EntryPointConfig, StaticConfig};
