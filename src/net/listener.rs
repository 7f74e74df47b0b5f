//! Listening sockets.
//!
//! # Responsibilities
//! - Bind TCP listeners with the entry point's socket options
//! - Bind UDP sockets
//! - Report bind failures with the address that failed

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, UdpSocket};

/// Pending connections the kernel queues before `accept`.
const BACKLOG: u32 = 1024;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),
}

/// Socket options applied before `listen`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOptions {
    pub reuse_port: bool,
    /// Inherited by accepted sockets.
    pub keep_alive: bool,
}

/// Bind a TCP listener on `address`.
pub fn bind_tcp(address: SocketAddr, options: SocketOptions) -> Result<TcpListener, ListenerError> {
    let bind_err = |source| ListenerError::Bind { address, source };

    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;

    #[cfg(unix)]
    socket.set_reuseaddr(true).map_err(bind_err)?;

    if options.reuse_port {
        set_reuse_port(&socket).map_err(bind_err)?;
    }
    socket.set_keepalive(options.keep_alive).map_err(bind_err)?;

    socket.bind(address).map_err(bind_err)?;
    let listener = socket.listen(BACKLOG).map_err(bind_err)?;

    tracing::info!(
        address = %listener.local_addr().unwrap_or(address),
        reuse_port = options.reuse_port,
        keep_alive = options.keep_alive,
        "Listener bound"
    );
    Ok(listener)
}

#[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
fn set_reuse_port(socket: &TcpSocket) -> io::Result<()> {
    socket.set_reuseport(true)
}

#[cfg(not(all(unix, not(target_os = "solaris"), not(target_os = "illumos"))))]
fn set_reuse_port(_socket: &TcpSocket) -> io::Result<()> {
    tracing::debug!("SO_REUSEPORT is not supported on this platform, ignoring");
    Ok(())
}

#[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
fn set_udp_reuse_port(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(all(unix, not(target_os = "solaris"), not(target_os = "illumos"))))]
fn set_udp_reuse_port(_socket: &Socket) -> io::Result<()> {
    tracing::debug!("SO_REUSEPORT is not supported on this platform, ignoring");
    Ok(())
}

/// Bind a UDP socket on `address`.
///
/// Built with socket2 since tokio has no `SO_REUSEPORT` setter for UDP.
pub async fn bind_udp(address: SocketAddr, reuse_port: bool) -> Result<UdpSocket, ListenerError> {
    let bind_err = |source| ListenerError::Bind { address, source };

    let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    if reuse_port {
        set_udp_reuse_port(&socket).map_err(bind_err)?;
    }
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&address.into()).map_err(bind_err)?;

    let socket = UdpSocket::from_std(socket.into()).map_err(bind_err)?;

    tracing::info!(
        address = %socket.local_addr().unwrap_or(address),
        reuse_port,
        "UDP socket bound"
    );
    Ok(socket)
}
