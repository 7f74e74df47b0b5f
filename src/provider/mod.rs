//! Dynamic configuration providers.
//!
//! # Data Flow
//! ```text
//! source (file, orchestrator, ...)
//!     → Provider::provide spawns its own task(s)
//!     → Message { provider_name, configuration } on the watcher's raw queue
//! ```
//!
//! # Design Decisions
//! - `provide` is called once at startup and must not block
//! - A provider failing never stops the others; the watcher only logs
//! - Retry policy belongs to the provider itself

pub mod file;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::loader::ConfigError;
use crate::config::Message;

pub use file::FileProvider;

/// Error returned when a provider cannot start.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: String,
        #[source]
        source: notify::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A source of dynamic configuration.
pub trait Provider: Send + Sync {
    /// Stable name used to qualify everything this provider defines.
    fn name(&self) -> &str;

    /// Start pushing configuration messages on `sender` until `token` is
    /// cancelled.
    fn provide(
        &self,
        sender: mpsc::Sender<Message>,
        token: CancellationToken,
    ) -> Result<(), ProviderError>;
}
