//! TLS server configuration for the embedded HTTPS server.
//!
//! # Responsibilities
//! - Load PEM certificates and keys, from files or inline content
//! - Index certificates by the DNS names they cover (SAN, else CN)
//! - Resolve the certificate per ClientHello server name, falling back to
//!   the store's default certificate
//! - Apply the `default` TLS options (minimum version, ALPN, SNI strictness)

use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, SupportedProtocolVersion};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::config::dynamic::{
    Certificate, TlsConfiguration, TlsOptions, ACME_TLS_ALPN_STORE, DEFAULT_TLS_NAME,
};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Picks a certificate from the ClientHello server name.
#[derive(Debug, Default)]
pub struct SniResolver {
    exact: HashMap<String, Arc<CertifiedKey>>,
    /// Keyed by the suffix after `*.`.
    wildcard: HashMap<String, Arc<CertifiedKey>>,
    default: Option<Arc<CertifiedKey>>,
    strict: bool,
}

impl SniResolver {
    fn add(&mut self, key: Arc<CertifiedKey>) {
        let names = key
            .cert
            .first()
            .map(certificate_names)
            .unwrap_or_default();
        // First certificate for a name wins.
        for name in names {
            if let Some(suffix) = name.strip_prefix("*.") {
                self.wildcard
                    .entry(suffix.to_string())
                    .or_insert_with(|| key.clone());
            } else {
                self.exact.entry(name).or_insert_with(|| key.clone());
            }
        }
    }

    pub fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = server_name {
            let name = name.to_ascii_lowercase();
            if let Some(key) = self.exact.get(&name) {
                return Some(key.clone());
            }
            if let Some((_, parent)) = name.split_once('.') {
                if let Some(key) = self.wildcard.get(parent) {
                    return Some(key.clone());
                }
            }
            if self.strict {
                return None;
            }
        }
        self.default.clone()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let key = self.lookup(client_hello.server_name());
        if key.is_none() {
            tracing::debug!(
                server_name = ?client_hello.server_name(),
                "No certificate matches server name"
            );
        }
        key
    }
}

/// Build the HTTPS server configuration from the `default` store.
///
/// Returns `None` when the store holds no certificate.
pub fn build_server_config(tls: &TlsConfiguration) -> Result<Option<Arc<ServerConfig>>, TlsError> {
    let mut resolver = SniResolver::default();
    for cert in tls.certificates.iter().filter(|c| c.in_store(DEFAULT_TLS_NAME)) {
        resolver.add(load_certified_key(&cert.certificate)?);
    }

    let store_default = tls
        .stores
        .get(DEFAULT_TLS_NAME)
        .and_then(|store| store.default_certificate.as_ref());
    resolver.default = match store_default {
        Some(cert) => Some(load_certified_key(cert)?),
        None => resolver
            .exact
            .values()
            .chain(resolver.wildcard.values())
            .next()
            .cloned(),
    };

    if resolver.default.is_none() && resolver.exact.is_empty() && resolver.wildcard.is_empty() {
        return Ok(None);
    }

    let default_options = TlsOptions::default();
    let options = tls.options.get(DEFAULT_TLS_NAME).unwrap_or(&default_options);
    resolver.strict = options.sni_strict;

    let versions: &[&'static SupportedProtocolVersion] = match options.min_version.as_str() {
        "VersionTLS13" => &[&rustls::version::TLS13],
        _ => &[&rustls::version::TLS12, &rustls::version::TLS13],
    };

    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(versions)?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(resolver));

    config.alpn_protocols = options
        .alpn_protocols
        .iter()
        .filter(|proto| proto.as_str() != ACME_TLS_ALPN_STORE)
        .map(|proto| proto.as_bytes().to_vec())
        .collect();
    if options.disable_session_tickets {
        config.send_tls13_tickets = 0;
    }

    Ok(Some(Arc::new(config)))
}

fn load_certified_key(cert: &Certificate) -> Result<Arc<CertifiedKey>, TlsError> {
    let cert_pem = read_pem(&cert.cert_file)?;
    let key_pem = read_pem(&cert.key_file)?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(&cert_pem[..]))
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Io {
            path: PathBuf::from(source_name(&cert.cert_file)),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(source_name(&cert.cert_file)));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(&key_pem[..]))
        .map_err(|source| TlsError::Io {
            path: PathBuf::from(source_name(&cert.key_file)),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(source_name(&cert.key_file)))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn is_inline(value: &str) -> bool {
    value.trim_start().starts_with("-----BEGIN")
}

fn source_name(value: &str) -> String {
    if is_inline(value) {
        "<inline PEM>".to_string()
    } else {
        value.to_string()
    }
}

fn read_pem(value: &str) -> Result<Vec<u8>, TlsError> {
    if is_inline(value) {
        return Ok(value.as_bytes().to_vec());
    }
    std::fs::read(value).map_err(|source| TlsError::Io {
        path: PathBuf::from(value),
        source,
    })
}

/// DNS names from the subject alternative names, else the common name.
fn certificate_names(cert: &CertificateDer<'_>) -> Vec<String> {
    let Ok((_, parsed)) = X509Certificate::from_der(cert.as_ref()) else {
        tracing::warn!("Failed to parse X.509 certificate");
        return Vec::new();
    };

    let mut names = Vec::new();
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_ascii_lowercase());
            }
        }
    }
    if names.is_empty() {
        names.extend(
            parsed
                .subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(str::to_ascii_lowercase),
        );
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::{CertAndStores, Store};

    fn self_signed(names: &[&str]) -> Certificate {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        Certificate {
            cert_file: cert.pem(),
            key_file: key_pair.serialize_pem(),
        }
    }

    fn names_of(key: &CertifiedKey) -> Vec<String> {
        certificate_names(&key.cert[0])
    }

    #[test]
    fn empty_store_builds_nothing() {
        assert!(build_server_config(&TlsConfiguration::default()).unwrap().is_none());
    }

    #[test]
    fn resolves_exact_wildcard_and_default() {
        let mut tls = TlsConfiguration::default();
        tls.certificates.push(CertAndStores {
            certificate: self_signed(&["api.example.com"]),
            stores: vec![],
        });
        tls.certificates.push(CertAndStores {
            certificate: self_signed(&["*.example.org"]),
            stores: vec![DEFAULT_TLS_NAME.into()],
        });
        tls.certificates.push(CertAndStores {
            certificate: self_signed(&["other.store"]),
            stores: vec!["other".into()],
        });
        tls.stores.insert(
            DEFAULT_TLS_NAME.into(),
            Store {
                default_certificate: Some(self_signed(&["fallback.local"])),
                ..Default::default()
            },
        );

        let mut resolver = SniResolver::default();
        for cert in tls.certificates.iter().filter(|c| c.in_store(DEFAULT_TLS_NAME)) {
            resolver.add(load_certified_key(&cert.certificate).unwrap());
        }
        resolver.default = Some(load_certified_key(&self_signed(&["fallback.local"])).unwrap());

        let exact = resolver.lookup(Some("API.example.com")).unwrap();
        assert_eq!(names_of(&exact), vec!["api.example.com"]);
        let wildcard = resolver.lookup(Some("www.example.org")).unwrap();
        assert_eq!(names_of(&wildcard), vec!["*.example.org"]);
        let fallback = resolver.lookup(Some("other.store")).unwrap();
        assert_eq!(names_of(&fallback), vec!["fallback.local"]);

        let config = build_server_config(&tls).unwrap().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn strict_sni_refuses_unknown_names() {
        let mut resolver = SniResolver {
            strict: true,
            ..Default::default()
        };
        resolver.add(load_certified_key(&self_signed(&["a.test"])).unwrap());
        resolver.default = resolver.exact.get("a.test").cloned();
        assert!(resolver.lookup(Some("b.test")).is_none());
        assert!(resolver.lookup(None).is_some());
    }

    #[test]
    fn loads_pem_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let inline = self_signed(&["disk.test"]);
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, &inline.cert_file).unwrap();
        std::fs::write(&key_path, &inline.key_file).unwrap();

        let key = load_certified_key(&Certificate {
            cert_file: cert_path.display().to_string(),
            key_file: key_path.display().to_string(),
        })
        .unwrap();
        assert_eq!(names_of(&key), vec!["disk.test"]);
    }

    #[test]
    fn missing_key_is_reported() {
        let cert = self_signed(&["nokey.test"]);
        let err = load_certified_key(&Certificate {
            cert_file: cert.cert_file,
            key_file: "-----BEGIN NOTHING-----\n-----END NOTHING-----\n".into(),
        })
        .unwrap_err();
        assert!(matches!(err, TlsError::NoPrivateKey(_)));
    }
}
