//! UDP entry point.
//!
//! Sessions keep the handler that was current when their first datagram
//! arrived. Shutdown stops new sessions after the accept grace, waits for
//! live ones to expire up to the grace deadline, then closes the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::schema::{EntryPointConfig, LifeCycleConfig, Protocol};
use crate::net::listener::{bind_udp, ListenerError};
use crate::server::{EntryPointState, ServerError};
use crate::udp::{DropHandler, UdpHandler, UdpHandlerSwitcher, UdpListener};

pub struct UdpEntryPoint {
    name: String,
    local_addr: SocketAddr,
    listener: UdpListener,
    switcher: UdpHandlerSwitcher,
    life_cycle: LifeCycleConfig,
    state: watch::Sender<EntryPointState>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl UdpEntryPoint {
    pub async fn bind(name: impl Into<String>, config: &EntryPointConfig) -> Result<Self, ServerError> {
        let name = name.into();
        let (address, protocol) = config
            .parse_address()
            .map_err(|reason| ServerError::Address {
                entry_point: name.clone(),
                reason,
            })?;
        if protocol != Protocol::Udp {
            return Err(ServerError::Address {
                entry_point: name,
                reason: "not a UDP address".to_string(),
            });
        }

        let socket = bind_udp(address, config.reuse_port)
            .await
            .map_err(|source| ServerError::Bind {
                entry_point: name.clone(),
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| ServerError::Bind {
            entry_point: name.clone(),
            source: ListenerError::Bind { address, source },
        })?;

        Ok(Self {
            name,
            local_addr,
            listener: UdpListener::new(socket, config.udp.timeout),
            switcher: UdpHandlerSwitcher::default(),
            life_cycle: config.transport.life_cycle.clone(),
            state: watch::Sender::new(EntryPointState::Created),
            task: tokio::sync::Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> EntryPointState {
        *self.state.borrow()
    }

    pub fn active_sessions(&self) -> usize {
        self.listener.session_count()
    }

    /// New sessions go to `handler`; live ones keep theirs.
    pub fn switch_handler(&self, handler: Arc<dyn UdpHandler>) {
        self.switcher.switch(handler);
        tracing::debug!(entry_point = %self.name, "UDP handler switched");
    }

    /// Back to dropping datagrams.
    pub fn reset_handler(&self) {
        self.switch_handler(Arc::new(DropHandler));
    }

    /// Start reading. Only the first call has an effect.
    pub fn start(&self) {
        let started = self.state.send_if_modified(|state| {
            if *state == EntryPointState::Created {
                *state = EntryPointState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        let task = tokio::spawn(self.listener.clone().run(self.switcher.clone()));
        if let Ok(mut slot) = self.task.try_lock() {
            *slot = Some(task);
        }
        tracing::info!(entry_point = %self.name, address = %self.local_addr, "UDP entry point started");
    }

    /// Drain sessions and close the socket.
    pub async fn shutdown(&self) {
        let proceed = self.state.send_if_modified(|state| match state {
            EntryPointState::Created | EntryPointState::Running => {
                *state = EntryPointState::Draining;
                true
            }
            EntryPointState::Draining | EntryPointState::Closed => false,
        });
        if !proceed {
            return;
        }

        let accept_grace = self.life_cycle.request_accept_grace_timeout;
        if !accept_grace.is_zero() {
            tokio::time::sleep(accept_grace).await;
        }
        self.listener.stop_accepting();

        let grace = self.life_cycle.grace_timeout;
        let drained = !grace.is_zero()
            && tokio::time::timeout(grace, self.listener.wait_idle())
                .await
                .is_ok();
        if !drained {
            let sessions = self.listener.session_count();
            if sessions > 0 {
                tracing::warn!(
                    entry_point = %self.name,
                    sessions,
                    grace_ms = grace.as_millis() as u64,
                    "Grace timeout exceeded, closing remaining UDP sessions"
                );
            }
        }

        self.listener.close();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!(entry_point = %self.name, error = %e, "UDP read loop failed");
            }
        }

        self.state.send_replace(EntryPointState::Closed);
        tracing::info!(entry_point = %self.name, "UDP entry point closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    use crate::udp::UdpProxy;

    fn udp_config(grace: Duration) -> EntryPointConfig {
        let mut config = EntryPointConfig {
            address: "127.0.0.1:0/udp".to_string(),
            ..Default::default()
        };
        config.transport.life_cycle.grace_timeout = grace;
        config.udp.timeout = Duration::from_secs(30);
        config
    }

    #[tokio::test]
    async fn drops_datagrams_by_default() {
        let ep = UdpEntryPoint::bind("dns", &udp_config(Duration::ZERO)).await.unwrap();
        ep.start();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"q", ep.local_addr()).await.unwrap();
        let mut buf = [0u8; 8];
        let reply = tokio::time::timeout(Duration::from_millis(100), client.recv(&mut buf)).await;
        assert!(reply.is_err());

        ep.shutdown().await;
        assert_eq!(ep.state(), EntryPointState::Closed);
    }

    async fn start_echo_backend() -> SocketAddr {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((n, from)) = backend.recv_from(&mut buf).await {
                let _ = backend.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    async fn echo_once(ep: &UdpEntryPoint) -> UdpSocket {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(ep.local_addr()).await.unwrap();
        client.send(b"hello").await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(1), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        client
    }

    #[tokio::test]
    async fn switched_handler_serves_new_sessions() {
        let backend_addr = start_echo_backend().await;
        let ep = UdpEntryPoint::bind("dns", &udp_config(Duration::from_millis(100)))
            .await
            .unwrap();
        ep.switch_handler(Arc::new(UdpProxy::new(vec![backend_addr.to_string()])));
        ep.start();

        let _client = echo_once(&ep).await;

        // The session outlives the 100ms grace and is closed at the deadline.
        let started = tokio::time::Instant::now();
        ep.shutdown().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(ep.active_sessions(), 0);
    }

    #[tokio::test]
    async fn shutdown_returns_once_sessions_expire_before_deadline() {
        let backend_addr = start_echo_backend().await;
        let mut config = udp_config(Duration::from_secs(5));
        config.udp.timeout = Duration::from_millis(200);
        let ep = UdpEntryPoint::bind("dns", &config).await.unwrap();
        ep.switch_handler(Arc::new(UdpProxy::new(vec![backend_addr.to_string()])));
        ep.start();

        let _client = echo_once(&ep).await;
        assert_eq!(ep.active_sessions(), 1);

        // The idle session ends after 200ms, far ahead of the 5s deadline.
        let started = tokio::time::Instant::now();
        ep.shutdown().await;
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(1), "waited for the deadline: {:?}", elapsed);
        assert_eq!(ep.active_sessions(), 0);
        assert_eq!(ep.state(), EntryPointState::Closed);
    }

    #[tokio::test]
    async fn rejects_tcp_address() {
        let config = EntryPointConfig {
            address: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            UdpEntryPoint::bind("web", &config).await,
            Err(ServerError::Address { .. })
        ));
    }
}
