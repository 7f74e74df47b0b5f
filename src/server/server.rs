//! The server: entry points, the configuration watcher, and the glue that
//! switches routers when configuration changes.
//!
//! # Responsibilities
//! - Bind every statically configured entry point (bind errors are fatal)
//! - Register providers and the router-switching listener on the watcher
//! - Start, stop and close everything in order
//!
//! # Design Decisions
//! - Entry points a merged configuration does not target get the default
//!   router, so stale routes never survive a reload
//! - Entry points drain concurrently; the watcher stops after them

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::config::schema::{Protocol, StaticConfig};
use crate::config::Configuration;
use crate::lifecycle::signals::spawn_log_rotation;
use crate::lifecycle::Shutdown;
use crate::observability::LogHandle;
use crate::provider::file::FileProvider;
use crate::provider::Provider;
use crate::server::entrypoint_tcp::default_router;
use crate::server::{RouterFactory, Routers, ServerError, TcpEntryPoint, UdpEntryPoint};
use crate::watcher::ConfigurationWatcher;

type TcpEntryPoints = Arc<BTreeMap<String, Arc<TcpEntryPoint>>>;
type UdpEntryPoints = Arc<BTreeMap<String, Arc<UdpEntryPoint>>>;

pub struct Server {
    tcp: TcpEntryPoints,
    udp: UdpEntryPoints,
    watcher: ConfigurationWatcher,
    shutdown: Shutdown,
    log: Option<LogHandle>,
    log_rotation: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind every entry point and wire the watcher to them.
    pub async fn new(
        config: &StaticConfig,
        factory: Arc<dyn RouterFactory>,
    ) -> Result<Self, ServerError> {
        let mut tcp = BTreeMap::new();
        let mut udp = BTreeMap::new();
        for (name, entry_point) in &config.entry_points {
            let (_, protocol) =
                entry_point
                    .parse_address()
                    .map_err(|reason| ServerError::Address {
                        entry_point: name.clone(),
                        reason,
                    })?;
            match protocol {
                Protocol::Tcp => {
                    tcp.insert(name.clone(), Arc::new(TcpEntryPoint::bind(name, entry_point)?));
                }
                Protocol::Udp => {
                    udp.insert(
                        name.clone(),
                        Arc::new(UdpEntryPoint::bind(name, entry_point).await?),
                    );
                }
            }
        }
        let tcp: TcpEntryPoints = Arc::new(tcp);
        let udp: UdpEntryPoints = Arc::new(udp);

        let mut watcher = ConfigurationWatcher::new(
            config.default_entry_points(),
            config.providers.throttle_duration,
        )
        .with_required_provider(config.providers.required_provider.clone());

        if let Some(file) = &config.providers.file {
            watcher.add_provider(Arc::new(FileProvider::new(file.clone())));
        }

        {
            let tcp = tcp.clone();
            let udp = udp.clone();
            watcher.add_listener(move |conf: Configuration| {
                let routers = factory.create_routers(&conf);
                switch_routers(&tcp, &udp, routers);
            });
        }

        Ok(Self {
            tcp,
            udp,
            watcher,
            shutdown: Shutdown::new(),
            log: None,
            log_rotation: None,
        })
    }

    /// Reopen this log on SIGUSR1 while the server runs.
    pub fn with_log_handle(mut self, log: LogHandle) -> Self {
        self.log = Some(log);
        self
    }

    /// Add a provider. Only providers added before [`start`](Self::start)
    /// are started.
    pub fn add_provider(&mut self, provider: Arc<dyn Provider>) {
        self.watcher.add_provider(provider);
    }

    pub fn watcher(&self) -> &ConfigurationWatcher {
        &self.watcher
    }

    pub fn tcp_entry_point(&self, name: &str) -> Option<&Arc<TcpEntryPoint>> {
        self.tcp.get(name)
    }

    pub fn udp_entry_point(&self, name: &str) -> Option<&Arc<UdpEntryPoint>> {
        self.udp.get(name)
    }

    /// Coordinator whose trigger resolves [`wait`](Self::wait).
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn start(&mut self) {
        self.watcher.start();
        for entry_point in self.tcp.values() {
            entry_point.start();
        }
        for entry_point in self.udp.values() {
            entry_point.start();
        }
        if let Some(log) = &self.log {
            self.log_rotation = Some(spawn_log_rotation(
                log.clone(),
                self.shutdown.child_token(),
            ));
        }
        tracing::info!(
            tcp_entry_points = self.tcp.len(),
            udp_entry_points = self.udp.len(),
            "Server started"
        );
    }

    /// Resolve once shutdown is triggered.
    pub async fn wait(&self) {
        self.shutdown.triggered().await
    }

    /// Drain every entry point, then stop the watcher.
    pub async fn stop(&mut self) {
        self.shutdown.trigger();

        let tcp = self.tcp.values().map(|ep| ep.shutdown());
        let udp = self.udp.values().map(|ep| ep.shutdown());
        tokio::join!(join_all(tcp), join_all(udp));

        self.watcher.stop().await;
        tracing::info!("Server stopped");
    }

    /// Release process-wide resources.
    pub async fn close(&mut self) {
        if let Some(task) = self.log_rotation.take() {
            task.abort();
            let _ = task.await;
        }
        tracing::info!("Server closed");
    }
}

fn switch_routers(tcp: &TcpEntryPoints, udp: &UdpEntryPoints, mut routers: Routers) {
    for (name, entry_point) in tcp.iter() {
        match routers.tcp.remove(name) {
            Some(router) => entry_point.switch_router(router),
            None => entry_point.switch_router(default_router()),
        }
    }
    for (name, entry_point) in udp.iter() {
        match routers.udp.remove(name) {
            Some(handler) => entry_point.switch_handler(handler),
            None => entry_point.reset_handler(),
        }
    }

    for name in routers.tcp.keys().chain(routers.udp.keys()) {
        tracing::warn!(entry_point = %name, "Router for unknown entry point ignored");
    }
}
