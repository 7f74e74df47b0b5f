//! PROXY protocol (v1 text and v2 binary) unwrapping on accepted connections.
//!
//! Wire formats (HAProxy PROXY protocol):
//! - v1: `PROXY TCP4|TCP6|UNKNOWN <src> <dst> <sport> <dport>\r\n`, at most
//!   107 bytes
//! - v2: 12 bytes signature, version/command, family/transport, 2 bytes
//!   length, then addresses and TLVs
//!
//! Headers are only honoured from trusted sources. A header sent by an
//! untrusted source is stripped and the socket address is kept.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::config::schema::ProxyProtocolConfig;
use crate::net::connection::Connection;

/// PROXY protocol v2 signature (12 bytes).
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const V1_PREFIX: &[u8] = b"PROXY ";
const V1_MAX_LEN: usize = 107;

const V2_HEADER_LEN: usize = 16;
const V2_COMMAND_LOCAL: u8 = 0x20;
const V2_COMMAND_PROXY: u8 = 0x21;
const AF_INET: u8 = 0x10;
const AF_INET6: u8 = 0x20;

/// Time allowed to receive a complete header.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ProxyProtocolError {
    #[error("invalid trusted IP or CIDR '{0}'")]
    InvalidCidr(String),

    #[error("malformed PROXY header: {0}")]
    Malformed(&'static str),

    #[error("timed out reading PROXY header")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IpNet {
    network: IpAddr,
    prefix_len: u8,
}

impl IpNet {
    fn parse(s: &str) -> Option<Self> {
        let (addr, prefix_len) = match s.split_once('/') {
            Some((addr, len)) => (addr.parse::<IpAddr>().ok()?, Some(len.parse::<u8>().ok()?)),
            None => (s.parse::<IpAddr>().ok()?, None),
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix_len = prefix_len.unwrap_or(max);
        if prefix_len > max {
            return None;
        }
        Some(Self {
            network: mask(addr, prefix_len),
            prefix_len,
        })
    }

    fn contains(&self, addr: IpAddr) -> bool {
        let addr = canonical(addr);
        addr.is_ipv4() == self.network.is_ipv4() && mask(addr, self.prefix_len) == self.network
    }
}

fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - prefix_len.min(32))
            };
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - prefix_len.min(128))
            };
            IpAddr::V6(Ipv6Addr::from(bits & mask))
        }
    }
}

/// IPv4-mapped IPv6 addresses compare as IPv4.
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}

/// Allow-list of PROXY header senders.
#[derive(Debug, Clone, Default)]
pub struct TrustedIps {
    nets: Vec<IpNet>,
}

impl TrustedIps {
    /// Parse CIDR ranges or bare IPs.
    pub fn new(entries: &[String]) -> Result<Self, ProxyProtocolError> {
        let nets = entries
            .iter()
            .map(|entry| {
                IpNet::parse(entry.trim()).ok_or_else(|| ProxyProtocolError::InvalidCidr(entry.clone()))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { nets })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(addr))
    }
}

/// Parsed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyHeader {
    /// Relayed connection with the original endpoints.
    Proxy {
        source: SocketAddr,
        destination: SocketAddr,
    },
    /// Health check or unknown family: keep the socket addresses.
    Local,
}

/// Result of inspecting the start of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// More bytes are needed to decide.
    Incomplete,
    /// The stream does not start with a PROXY header.
    Absent,
    /// A header of `len` bytes.
    Header { header: ProxyHeader, len: usize },
}

/// Parse a v1 or v2 header at the start of `buf`.
pub fn parse(buf: &[u8]) -> Result<Parsed, ProxyProtocolError> {
    if buf.is_empty() {
        return Ok(Parsed::Incomplete);
    }
    if starts_like(buf, &V2_SIGNATURE) {
        if buf.len() < V2_SIGNATURE.len() {
            return Ok(Parsed::Incomplete);
        }
        return parse_v2(buf);
    }
    if starts_like(buf, V1_PREFIX) {
        if buf.len() < V1_PREFIX.len() {
            return Ok(Parsed::Incomplete);
        }
        return parse_v1(buf);
    }
    Ok(Parsed::Absent)
}

/// `buf` and `prefix` agree on their common length.
fn starts_like(buf: &[u8], prefix: &[u8]) -> bool {
    let n = buf.len().min(prefix.len());
    buf[..n] == prefix[..n]
}

fn parse_v1(buf: &[u8]) -> Result<Parsed, ProxyProtocolError> {
    let window = &buf[..buf.len().min(V1_MAX_LEN)];
    let Some(end) = window.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= V1_MAX_LEN {
            return Err(ProxyProtocolError::Malformed("v1 header too long"));
        }
        return Ok(Parsed::Incomplete);
    };

    let line = std::str::from_utf8(&buf[..end])
        .map_err(|_| ProxyProtocolError::Malformed("v1 header is not ASCII"))?;
    let mut parts = line.split(' ').skip(1);
    let header = match parts.next() {
        Some("UNKNOWN") => ProxyHeader::Local,
        Some(family @ ("TCP4" | "TCP6")) => {
            let fields: Vec<&str> = parts.collect();
            let [src, dst, sport, dport] = fields.as_slice() else {
                return Err(ProxyProtocolError::Malformed("v1 header field count"));
            };
            let src: IpAddr = src
                .parse()
                .map_err(|_| ProxyProtocolError::Malformed("v1 source address"))?;
            let dst: IpAddr = dst
                .parse()
                .map_err(|_| ProxyProtocolError::Malformed("v1 destination address"))?;
            if src.is_ipv4() != (family == "TCP4") || dst.is_ipv4() != (family == "TCP4") {
                return Err(ProxyProtocolError::Malformed("v1 address family mismatch"));
            }
            let sport: u16 = sport
                .parse()
                .map_err(|_| ProxyProtocolError::Malformed("v1 source port"))?;
            let dport: u16 = dport
                .parse()
                .map_err(|_| ProxyProtocolError::Malformed("v1 destination port"))?;
            ProxyHeader::Proxy {
                source: SocketAddr::new(src, sport),
                destination: SocketAddr::new(dst, dport),
            }
        }
        _ => return Err(ProxyProtocolError::Malformed("v1 protocol family")),
    };

    Ok(Parsed::Header {
        header,
        len: end + 2,
    })
}

fn parse_v2(buf: &[u8]) -> Result<Parsed, ProxyProtocolError> {
    if buf.len() < V2_HEADER_LEN {
        return Ok(Parsed::Incomplete);
    }

    let version_command = buf[12];
    let family = buf[13] & 0xF0;
    let addr_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let len = V2_HEADER_LEN + addr_len;
    if buf.len() < len {
        return Ok(Parsed::Incomplete);
    }

    let header = match version_command {
        V2_COMMAND_LOCAL => ProxyHeader::Local,
        V2_COMMAND_PROXY => {
            let data = &buf[V2_HEADER_LEN..len];
            match family {
                AF_INET => {
                    if data.len() < 12 {
                        return Err(ProxyProtocolError::Malformed("v2 IPv4 block too short"));
                    }
                    let src = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
                    let dst = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
                    ProxyHeader::Proxy {
                        source: SocketAddr::new(src.into(), u16::from_be_bytes([data[8], data[9]])),
                        destination: SocketAddr::new(
                            dst.into(),
                            u16::from_be_bytes([data[10], data[11]]),
                        ),
                    }
                }
                AF_INET6 => {
                    if data.len() < 36 {
                        return Err(ProxyProtocolError::Malformed("v2 IPv6 block too short"));
                    }
                    let mut src = [0u8; 16];
                    let mut dst = [0u8; 16];
                    src.copy_from_slice(&data[0..16]);
                    dst.copy_from_slice(&data[16..32]);
                    ProxyHeader::Proxy {
                        source: SocketAddr::new(
                            Ipv6Addr::from(src).into(),
                            u16::from_be_bytes([data[32], data[33]]),
                        ),
                        destination: SocketAddr::new(
                            Ipv6Addr::from(dst).into(),
                            u16::from_be_bytes([data[34], data[35]]),
                        ),
                    }
                }
                // AF_UNSPEC and AF_UNIX carry nothing usable for a TCP peer.
                _ => ProxyHeader::Local,
            }
        }
        _ => return Err(ProxyProtocolError::Malformed("v2 version or command")),
    };

    Ok(Parsed::Header { header, len })
}

/// Per entry point PROXY protocol policy.
#[derive(Debug, Clone)]
pub struct ProxyProtocolPolicy {
    insecure: bool,
    trusted: TrustedIps,
}

impl ProxyProtocolPolicy {
    pub fn from_config(config: &ProxyProtocolConfig) -> Result<Self, ProxyProtocolError> {
        Ok(Self {
            insecure: config.insecure,
            trusted: TrustedIps::new(&config.trusted_ips)?,
        })
    }

    fn trusts(&self, addr: IpAddr) -> bool {
        self.insecure || self.trusted.contains(addr)
    }

    /// Read and strip a header from `conn`, updating its peer address when
    /// the sender is trusted. Bytes after the header stay buffered.
    pub async fn unwrap(&self, conn: &mut Connection) -> Result<(), ProxyProtocolError> {
        let header = tokio::time::timeout(HEADER_TIMEOUT, read_header(conn))
            .await
            .map_err(|_| ProxyProtocolError::Timeout)??;

        let Some(ProxyHeader::Proxy { source, .. }) = header else {
            return Ok(());
        };

        if self.trusts(conn.peer_addr().ip()) {
            tracing::trace!(
                connection_id = %conn.id(),
                peer_addr = %conn.peer_addr(),
                source = %source,
                "PROXY header accepted"
            );
            conn.set_peer_addr(source);
        } else {
            tracing::debug!(
                connection_id = %conn.id(),
                peer_addr = %conn.peer_addr(),
                "Ignoring PROXY header from untrusted source"
            );
        }
        Ok(())
    }
}

async fn read_header(conn: &mut Connection) -> Result<Option<ProxyHeader>, ProxyProtocolError> {
    loop {
        match parse(conn.buffered())? {
            Parsed::Absent => return Ok(None),
            Parsed::Header { header, len } => {
                conn.consume(len);
                return Ok(Some(header));
            }
            Parsed::Incomplete => {
                if conn.fill().await? == 0 {
                    // Whatever was read is replayed; nothing to strip.
                    return Ok(None);
                }
            }
        }
    }
}
