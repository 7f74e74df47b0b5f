//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use dynproxy::config::dynamic::{
    Configuration, HttpConfiguration, Router, TcpConfiguration, TcpRouter, TcpServer,
    TcpServersLoadBalancer, TcpService,
};
use dynproxy::config::schema::EntryPointConfig;

/// Start a TCP backend that writes `tag` and then echoes everything back.
pub async fn start_tagged_echo(tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        if socket.write_all(tag.as_bytes()).await.is_err() {
                            return;
                        }
                        let mut buf = [0u8; 1024];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Start a UDP backend that echoes every datagram.
pub async fn start_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// Entry point on an ephemeral loopback port.
pub fn local_entry_point() -> EntryPointConfig {
    EntryPointConfig {
        address: "127.0.0.1:0".to_string(),
        ..Default::default()
    }
}

/// HTTP configuration with one router `r` whose rule is `rule`.
pub fn http_configuration(rule: &str) -> Configuration {
    let mut http = HttpConfiguration::default();
    http.routers.insert(
        "r".to_string(),
        Router {
            rule: rule.to_string(),
            service: "svc".to_string(),
            ..Default::default()
        },
    );
    Configuration {
        http: Some(http),
        ..Default::default()
    }
}

/// TCP configuration routing `rule` on `entry_point` to `backend`.
pub fn tcp_configuration(entry_point: &str, rule: &str, backend: SocketAddr) -> Configuration {
    let mut tcp = TcpConfiguration::default();
    tcp.routers.insert(
        "route".to_string(),
        TcpRouter {
            entry_points: vec![entry_point.to_string()],
            service: "backend".to_string(),
            rule: rule.to_string(),
            ..Default::default()
        },
    );
    tcp.services.insert(
        "backend".to_string(),
        TcpService {
            load_balancer: Some(TcpServersLoadBalancer {
                servers: vec![TcpServer {
                    address: backend.to_string(),
                    tls: false,
                }],
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    Configuration {
        tcp: Some(tcp),
        ..Default::default()
    }
}

/// Listener callback that records every configuration it receives.
pub fn recorder() -> (
    impl Fn(Configuration) + Send + Sync + 'static,
    Arc<Mutex<Vec<Configuration>>>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (move |conf| sink.lock().unwrap().push(conf), seen)
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Connect to `addr` and read the backend's tag.
pub async fn read_tag(addr: SocketAddr, len: usize) -> std::io::Result<String> {
    let mut stream = tokio::net::TcpStream::connect(addr).await?;
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no tag"))??;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Self-signed certificate and key for `names`, as PEM.
pub fn self_signed(names: &[&str]) -> (String, String) {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names).unwrap();
    (cert.pem(), key_pair.serialize_pem())
}

/// TLS client trusting exactly the given certificate.
pub fn tls_connector(cert_pem: &str) -> tokio_rustls::TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut cert_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// HTTP client that never reuses connections.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
