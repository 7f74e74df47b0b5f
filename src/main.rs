use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use dynproxy::config::loader::load_config;
use dynproxy::lifecycle::signals::shutdown_signal;
use dynproxy::observability::init_logging;
use dynproxy::{DefaultRouterFactory, Server};

#[derive(Parser)]
#[command(name = "dynproxy")]
#[command(about = "Reverse proxy with dynamic configuration", long_about = None)]
struct Cli {
    /// Static configuration file
    #[arg(short, long, default_value = "dynproxy.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }

    let log = init_logging(&config.log).context("initializing logging")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        entry_points = config.entry_points.len(),
        "dynproxy starting"
    );

    let factory = Arc::new(DefaultRouterFactory::new(&config));
    let mut server = Server::new(&config, factory)
        .await
        .context("building server")?
        .with_log_handle(log);

    server.start();

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = server.wait() => {}
    }

    server.stop().await;
    server.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
