//! TLS ClientHello inspection.
//!
//! Peeks the first record of a connection to decide whether it is TLS and,
//! if so, which server name and ALPN protocols the client asks for. The
//! bytes stay buffered on the [`Connection`] and are replayed to whichever
//! handler receives it.
//!
//! ClientHello layout after the 5-byte record header:
//! - handshake type (1), length (3), client version (2), random (32)
//! - session id (1 + n), cipher suites (2 + n), compression (1 + n)
//! - extensions (2 + n): SNI is type 0x0000, ALPN is type 0x0010

use std::io;
use std::time::Duration;

use crate::net::connection::Connection;

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;
const RECORD_HEADER_LEN: usize = 5;
const MAX_RECORD_LEN: usize = 16384 + 2048;

/// What the first bytes of a connection revealed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub is_tls: bool,
    /// Lowercased, without trailing dot.
    pub server_name: Option<String>,
    pub alpn: Vec<String>,
}

/// Inspect `conn` without consuming its bytes.
///
/// A connection that stays silent for `timeout` is treated as non-TLS; the
/// handler it ends up with decides what to do with it.
pub async fn peek_client_hello(conn: &mut Connection, timeout: Duration) -> io::Result<ClientHello> {
    match tokio::time::timeout(timeout, read_record(conn)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!(connection_id = %conn.id(), "ClientHello peek timed out");
            Ok(ClientHello::default())
        }
    }
}

async fn read_record(conn: &mut Connection) -> io::Result<ClientHello> {
    while conn.buffered().is_empty() {
        if conn.fill().await? == 0 {
            return Ok(ClientHello::default());
        }
    }
    if conn.buffered()[0] != RECORD_HANDSHAKE {
        return Ok(ClientHello::default());
    }

    while conn.buffered().len() < RECORD_HEADER_LEN {
        if conn.fill().await? == 0 {
            return Ok(ClientHello::default());
        }
    }
    let header = conn.buffered();
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if record_len > MAX_RECORD_LEN {
        return Ok(ClientHello {
            is_tls: true,
            ..Default::default()
        });
    }

    let total = RECORD_HEADER_LEN + record_len;
    while conn.buffered().len() < total {
        if conn.fill().await? == 0 {
            break;
        }
    }

    let record = &conn.buffered()[..total.min(conn.buffered().len())];
    Ok(parse_client_hello(record))
}

/// Parse a buffered record. Anything past the record header that does not
/// parse still counts as TLS, with no server name.
pub fn parse_client_hello(record: &[u8]) -> ClientHello {
    if record.first() != Some(&RECORD_HANDSHAKE) {
        return ClientHello::default();
    }
    let mut hello = ClientHello {
        is_tls: true,
        ..Default::default()
    };
    if let Some((server_name, alpn)) = parse_extensions(record.get(RECORD_HEADER_LEN..).unwrap_or(&[])) {
        hello.server_name = server_name;
        hello.alpn = alpn;
    }
    hello
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let (&b, rest) = self.data.split_first()?;
        self.data = rest;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let bytes = self.take(3)?;
        Some(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Some(head)
    }

    fn vec8(&mut self) -> Option<&'a [u8]> {
        let n = self.u8()? as usize;
        self.take(n)
    }

    fn vec16(&mut self) -> Option<&'a [u8]> {
        let n = self.u16()? as usize;
        self.take(n)
    }
}

type Extensions = (Option<String>, Vec<String>);

fn parse_extensions(handshake: &[u8]) -> Option<Extensions> {
    let mut r = Reader { data: handshake };
    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let len = r.u24()?;
    let mut r = Reader { data: r.take(len)? };

    r.take(2 + 32)?;
    r.vec8()?;
    r.vec16()?;
    r.vec8()?;

    let mut server_name = None;
    let mut alpn = Vec::new();

    // A ClientHello without extensions is legal.
    let Some(extensions) = r.vec16() else {
        return Some((None, alpn));
    };
    let mut r = Reader { data: extensions };
    while !r.data.is_empty() {
        let kind = r.u16()?;
        let body = r.vec16()?;
        match kind {
            EXT_SERVER_NAME => server_name = parse_server_name(body),
            EXT_ALPN => alpn = parse_alpn(body).unwrap_or_default(),
            _ => {}
        }
    }

    Some((server_name, alpn))
}

fn parse_server_name(body: &[u8]) -> Option<String> {
    let mut r = Reader { data: body };
    let mut list = Reader { data: r.vec16()? };
    while !list.data.is_empty() {
        let name_type = list.u8()?;
        let name = list.vec16()?;
        if name_type == 0 {
            let name = std::str::from_utf8(name).ok()?;
            return Some(name.to_ascii_lowercase().trim_end_matches('.').to_string());
        }
    }
    None
}

fn parse_alpn(body: &[u8]) -> Option<Vec<String>> {
    let mut r = Reader { data: body };
    let mut list = Reader { data: r.vec16()? };
    let mut protocols = Vec::new();
    while !list.data.is_empty() {
        let proto = list.vec8()?;
        protocols.push(String::from_utf8_lossy(proto).into_owned());
    }
    Some(protocols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rustls::pki_types::ServerName;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    /// First flight of a real rustls client.
    fn client_hello(server_name: &str, alpn: &[&str]) -> Vec<u8> {
        let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

        let name = ServerName::try_from(server_name.to_string()).unwrap();
        let mut conn = rustls::ClientConnection::new(Arc::new(config), name).unwrap();
        let mut out = Vec::new();
        while conn.wants_write() {
            conn.write_tls(&mut out).unwrap();
        }
        out
    }

    #[test]
    fn extracts_sni_and_alpn() {
        let hello = parse_client_hello(&client_hello("Example.COM", &["h2", "http/1.1"]));
        assert!(hello.is_tls);
        assert_eq!(hello.server_name.as_deref(), Some("example.com"));
        assert_eq!(hello.alpn, vec!["h2", "http/1.1"]);
    }

    #[test]
    fn plain_http_is_not_tls() {
        let hello = parse_client_hello(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(hello, ClientHello::default());
    }

    #[test]
    fn truncated_hello_is_tls_without_name() {
        let data = client_hello("example.com", &[]);
        let hello = parse_client_hello(&data[..20]);
        assert!(hello.is_tls);
        assert!(hello.server_name.is_none());
    }

    #[tokio::test]
    async fn peek_keeps_bytes_for_replay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let mut conn = Connection::new(server).unwrap();

        let data = client_hello("db.internal", &[]);
        client.write_all(&data).await.unwrap();

        let hello = peek_client_hello(&mut conn, Duration::from_secs(1)).await.unwrap();
        assert_eq!(hello.server_name.as_deref(), Some("db.internal"));
        assert_eq!(conn.buffered(), &data[..]);
    }

    #[tokio::test]
    async fn silent_client_times_out_as_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let mut conn = Connection::new(server).unwrap();

        let hello = peek_client_hello(&mut conn, Duration::from_millis(50)).await.unwrap();
        assert!(!hello.is_tls);
    }
}
