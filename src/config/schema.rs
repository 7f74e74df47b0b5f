//! Static configuration schema.
//!
//! The static configuration is read once at startup: entry points, provider
//! settings and logging. Everything routable lives in the dynamic
//! configuration (see [`crate::config::dynamic`]).

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration::duration_ms;

/// Root static configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StaticConfig {
    /// Entry points by name.
    pub entry_points: BTreeMap<String, EntryPointConfig>,

    /// Dynamic configuration providers.
    pub providers: ProvidersConfig,

    /// Logging settings.
    pub log: LogConfig,
}

impl StaticConfig {
    /// Entry points that receive routers declaring no entry points.
    ///
    /// Those flagged `as_default`, or every TCP entry point when none is.
    pub fn default_entry_points(&self) -> Vec<String> {
        let flagged: Vec<String> = self
            .entry_points
            .iter()
            .filter(|(_, ep)| ep.as_default)
            .map(|(name, _)| name.clone())
            .collect();
        if !flagged.is_empty() {
            return flagged;
        }

        self.entry_points
            .iter()
            .filter(|(_, ep)| {
                ep.parse_address()
                    .map(|(_, proto)| proto == Protocol::Tcp)
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Transport protocol of an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A listening address and its transport settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EntryPointConfig {
    /// `host:port`, `:port`, optionally suffixed with `/tcp` or `/udp`.
    pub address: String,

    /// Request `SO_REUSEPORT` on the listening socket.
    pub reuse_port: bool,

    /// Enable TCP keep-alive on accepted connections.
    pub keep_alive: bool,

    /// Receive routers that declare no entry points.
    pub as_default: bool,

    /// PROXY protocol unwrapping on accepted connections.
    pub proxy_protocol: Option<ProxyProtocolConfig>,

    /// Connection lifecycle and timeouts.
    pub transport: TransportConfig,

    /// UDP session settings.
    pub udp: UdpConfig,
}

impl Default for EntryPointConfig {
    fn default() -> Self {
        Self {
            address: ":80".to_string(),
            reuse_port: false,
            keep_alive: true,
            as_default: false,
            proxy_protocol: None,
            transport: TransportConfig::default(),
            udp: UdpConfig::default(),
        }
    }
}

impl EntryPointConfig {
    /// Parse the address into a socket address and a protocol.
    ///
    /// An empty host binds every IPv4 interface.
    pub fn parse_address(&self) -> Result<(SocketAddr, Protocol), String> {
        let (host_port, protocol) = match self.address.rsplit_once('/') {
            Some((addr, proto)) => match proto.to_ascii_lowercase().as_str() {
                "tcp" => (addr, Protocol::Tcp),
                "udp" => (addr, Protocol::Udp),
                other => return Err(format!("unsupported protocol '{}'", other)),
            },
            None => (self.address.as_str(), Protocol::Tcp),
        };

        if let Some(port) = host_port.strip_prefix(':') {
            let port: u16 = port
                .parse()
                .map_err(|e| format!("invalid port '{}': {}", port, e))?;
            return Ok((
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                protocol,
            ));
        }

        host_port
            .parse::<SocketAddr>()
            .map(|addr| (addr, protocol))
            .map_err(|e| format!("invalid address '{}': {}", host_port, e))
    }
}

/// PROXY protocol settings of an entry point.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyProtocolConfig {
    /// Trust headers from any source.
    pub insecure: bool,

    /// Sources allowed to send a header, as CIDR ranges or bare IPs.
    pub trusted_ips: Vec<String>,
}

/// Connection transport settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub life_cycle: LifeCycleConfig,

    /// How long to wait for the first bytes of a connection before deciding
    /// it is not TLS.
    #[serde(with = "duration_ms", rename = "client_hello_timeout_ms")]
    pub client_hello_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            life_cycle: LifeCycleConfig::default(),
            client_hello_timeout: Duration::from_secs(2),
        }
    }
}

/// Graceful shutdown phases. A zero duration skips the phase.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifeCycleConfig {
    /// Keep accepting for this long after shutdown starts.
    #[serde(with = "duration_ms", rename = "request_accept_grace_timeout_ms")]
    pub request_accept_grace_timeout: Duration,

    /// Drain deadline for in-flight work.
    #[serde(with = "duration_ms", rename = "grace_timeout_ms")]
    pub grace_timeout: Duration,
}

impl Default for LifeCycleConfig {
    fn default() -> Self {
        Self {
            request_accept_grace_timeout: Duration::ZERO,
            grace_timeout: Duration::from_secs(10),
        }
    }
}

/// UDP session settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Idle timeout of a session.
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
        }
    }
}

/// Provider-wide settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Minimum spacing between two published updates of one provider.
    #[serde(with = "duration_ms", rename = "throttle_duration_ms")]
    pub throttle_duration: Duration,

    /// Hold publication until this provider has delivered once.
    pub required_provider: Option<String>,

    /// File provider.
    pub file: Option<FileProviderConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            throttle_duration: Duration::from_secs(2),
            required_provider: None,
            file: None,
        }
    }
}

/// File provider settings. Exactly one of `filename` and `directory`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FileProviderConfig {
    pub filename: Option<PathBuf>,
    pub directory: Option<PathBuf>,
    pub watch: bool,
}

impl Default for FileProviderConfig {
    fn default() -> Self {
        Self {
            filename: None,
            directory: None,
            watch: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    pub format: LogFormat,

    /// Write logs to this file instead of stderr. Reopened on SIGUSR1.
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_point(address: &str) -> EntryPointConfig {
        EntryPointConfig {
            address: address.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_port_only_address() {
        let (addr, proto) = entry_point(":8080").parse_address().unwrap();
        assert_eq!(addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(proto, Protocol::Tcp);
    }

    #[test]
    fn parses_udp_suffix() {
        let (addr, proto) = entry_point("127.0.0.1:53/udp").parse_address().unwrap();
        assert_eq!(addr, "127.0.0.1:53".parse().unwrap());
        assert_eq!(proto, Protocol::Udp);
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!(entry_point(":53/sctp").parse_address().is_err());
        assert!(entry_point("nonsense").parse_address().is_err());
    }

    #[test]
    fn default_entry_points_skip_udp() {
        let mut config = StaticConfig::default();
        config.entry_points.insert("web".into(), entry_point(":80"));
        config.entry_points.insert("dns".into(), entry_point(":53/udp"));
        assert_eq!(config.default_entry_points(), vec!["web".to_string()]);

        config.entry_points.insert(
            "websecure".into(),
            EntryPointConfig {
                as_default: true,
                ..entry_point(":443")
            },
        );
        assert_eq!(config.default_entry_points(), vec!["websecure".to_string()]);
    }

    #[test]
    fn deserializes_millisecond_durations() {
        let config: StaticConfig = toml::from_str(
            r#"
            [entry_points.web]
            address = ":8080"
            [entry_points.web.transport.life_cycle]
            request_accept_grace_timeout_ms = 500
            grace_timeout_ms = 2000

            [providers]
            throttle_duration_ms = 250
            "#,
        )
        .unwrap();

        let web = &config.entry_points["web"];
        assert_eq!(
            web.transport.life_cycle.request_accept_grace_timeout,
            Duration::from_millis(500)
        );
        assert_eq!(web.transport.life_cycle.grace_timeout, Duration::from_secs(2));
        assert_eq!(config.providers.throttle_duration, Duration::from_millis(250));
        assert!(web.keep_alive);
    }
}
