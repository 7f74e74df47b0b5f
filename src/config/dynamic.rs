//! Dynamic configuration model.
//!
//! A [`Configuration`] is the snapshot a provider submits. It has four
//! independent sections (HTTP, TCP, UDP, TLS), each a mapping from entity
//! name to definition. Names are only unique within one provider until the
//! merger qualifies them as `name@provider`.
//!
//! All maps are `BTreeMap` so merged output and debug dumps are
//! deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the TLS store and TLS options that are never qualified.
pub const DEFAULT_TLS_NAME: &str = "default";

/// Store reserved for ACME TLS-ALPN-01 challenge certificates.
pub const ACME_TLS_ALPN_STORE: &str = "acme-tls/1";

/// The only provider allowed to put certificates in [`ACME_TLS_ALPN_STORE`].
pub const ACME_TLS_ALPN_PROVIDER: &str = "tlsalpn.acme";

/// Provider name of configuration generated by the proxy itself.
pub const INTERNAL_PROVIDER: &str = "internal";

/// Unit exchanged on the configuration pipeline.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct Message {
    pub provider_name: String,
    pub configuration: Option<Configuration>,
}

impl Message {
    pub fn new(provider_name: impl Into<String>, configuration: Configuration) -> Self {
        Self {
            provider_name: provider_name.into(),
            configuration: Some(configuration),
        }
    }

    /// A message without configuration, or whose sections are all empty.
    pub fn is_empty(&self) -> bool {
        self.configuration
            .as_ref()
            .map_or(true, Configuration::is_empty)
    }
}

/// Last accepted configuration per provider name.
pub type Configurations = BTreeMap<String, Configuration>;

/// A full dynamic configuration snapshot.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Configuration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfiguration>,
}

impl Configuration {
    /// Every section is absent or has no entries.
    pub fn is_empty(&self) -> bool {
        self.http.as_ref().map_or(true, HttpConfiguration::is_empty)
            && self.tcp.as_ref().map_or(true, TcpConfiguration::is_empty)
            && self.udp.as_ref().map_or(true, UdpConfiguration::is_empty)
            && self.tls.as_ref().map_or(true, TlsConfiguration::is_empty)
    }

    /// A configuration with all four sections present and empty.
    pub fn empty_sections() -> Self {
        Self {
            http: Some(HttpConfiguration::default()),
            tcp: Some(TcpConfiguration::default()),
            udp: Some(UdpConfiguration::default()),
            tls: Some(TlsConfiguration::default()),
        }
    }
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfiguration {
    pub routers: BTreeMap<String, Router>,
    pub middlewares: BTreeMap<String, Middleware>,
    pub services: BTreeMap<String, Service>,
    pub models: BTreeMap<String, Model>,
    pub servers_transports: BTreeMap<String, ServersTransport>,
}

impl HttpConfiguration {
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
            && self.middlewares.is_empty()
            && self.services.is_empty()
            && self.models.is_empty()
            && self.servers_transports.is_empty()
    }
}

/// An HTTP router definition.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Router {
    pub entry_points: Vec<String>,
    pub middlewares: Vec<String>,
    pub service: String,
    pub rule: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rule_syntax: String,
    pub priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTlsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<RouterObservabilityConfig>,
    /// Routers this one was derived from. Empty for root routers.
    pub parent_refs: Vec<String>,
    /// Set on routers whose rule was generated rather than written.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub default_rule: bool,
}

impl Router {
    /// A root router has no parent references and is eligible for models.
    pub fn is_root(&self) -> bool {
        self.parent_refs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterTlsConfig {
    pub options: String,
    pub cert_resolver: String,
    pub domains: Vec<Domain>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Domain {
    pub main: String,
    pub sans: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceVerbosity {
    Minimal,
    Detailed,
}

/// Per-router observability switches. `None` means "not set".
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_logs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_verbosity: Option<TraceVerbosity>,
}

/// Per-entrypoint default router template, named `entryPoint@internal`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Model {
    pub middlewares: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTlsConfig>,
    pub observability: RouterObservabilityConfig,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub default_rule_syntax: String,
}

/// Middleware definitions are opaque to the core: one key naming the
/// middleware kind, holding its settings.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct Middleware {
    #[serde(flatten)]
    pub spec: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Service {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<ServersLoadBalancer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weighted: Option<WeightedRoundRobin>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServersLoadBalancer {
    pub servers: Vec<HttpServer>,
    pub pass_host_header: Option<bool>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub servers_transport: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpServer {
    pub url: String,
    pub weight: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WeightedRoundRobin {
    pub services: Vec<WeightedService>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WeightedService {
    pub name: String,
    pub weight: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServersTransport {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub root_cas: Vec<String>,
    pub max_idle_conns_per_host: Option<u32>,
}

// ============================================================================
// TCP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpConfiguration {
    pub routers: BTreeMap<String, TcpRouter>,
    pub middlewares: BTreeMap<String, TcpMiddleware>,
    pub services: BTreeMap<String, TcpService>,
    pub models: BTreeMap<String, TcpModel>,
    pub servers_transports: BTreeMap<String, TcpServersTransport>,
}

impl TcpConfiguration {
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
            && self.middlewares.is_empty()
            && self.services.is_empty()
            && self.models.is_empty()
            && self.servers_transports.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpRouter {
    pub entry_points: Vec<String>,
    pub middlewares: Vec<String>,
    pub service: String,
    pub rule: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rule_syntax: String,
    pub priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTcpTlsConfig>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterTcpTlsConfig {
    pub passthrough: bool,
    pub options: String,
    pub cert_resolver: String,
    pub domains: Vec<Domain>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpModel {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub default_rule_syntax: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpMiddleware {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_allow_list: Option<TcpIpAllowList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight_conn: Option<TcpInFlightConn>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpIpAllowList {
    pub source_range: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpInFlightConn {
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpService {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<TcpServersLoadBalancer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weighted: Option<WeightedRoundRobin>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpServersLoadBalancer {
    pub servers: Vec<TcpServer>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub servers_transport: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpServer {
    pub address: String,
    pub tls: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpServersTransport {
    pub dial_timeout_ms: Option<u64>,
    pub dial_keep_alive_ms: Option<u64>,
    pub termination_delay_ms: Option<u64>,
}

// ============================================================================
// UDP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpConfiguration {
    pub routers: BTreeMap<String, UdpRouter>,
    pub services: BTreeMap<String, UdpService>,
}

impl UdpConfiguration {
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty() && self.services.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpRouter {
    pub entry_points: Vec<String>,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpService {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<UdpServersLoadBalancer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weighted: Option<WeightedRoundRobin>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpServersLoadBalancer {
    pub servers: Vec<UdpServer>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpServer {
    pub address: String,
}

// ============================================================================
// TLS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfiguration {
    pub certificates: Vec<CertAndStores>,
    pub options: BTreeMap<String, TlsOptions>,
    pub stores: BTreeMap<String, Store>,
}

impl TlsConfiguration {
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty() && self.options.is_empty() && self.stores.is_empty()
    }
}

/// A certificate and the stores it belongs to. An empty store list means
/// the `default` store.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CertAndStores {
    pub certificate: Certificate,
    pub stores: Vec<String>,
}

impl CertAndStores {
    pub fn in_store(&self, store: &str) -> bool {
        if self.stores.is_empty() {
            return store == DEFAULT_TLS_NAME;
        }
        self.stores.iter().any(|s| s == store)
    }
}

/// PEM certificate and key. Each field holds either a file path or the
/// PEM content itself.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Certificate {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Store {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_certificate: Option<Certificate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_generated_cert: Option<GeneratedCert>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneratedCert {
    pub resolver: String,
    pub domain: Option<Domain>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsOptions {
    pub min_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub max_version: String,
    pub cipher_suites: Vec<String>,
    pub curve_preferences: Vec<String>,
    pub sni_strict: bool,
    pub alpn_protocols: Vec<String>,
    pub disable_session_tickets: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_auth: Option<ClientAuth>,
}

impl Default for TlsOptions {
    /// The built-in `default` options injected when no provider defines any.
    fn default() -> Self {
        Self {
            min_version: "VersionTLS12".to_string(),
            max_version: String::new(),
            cipher_suites: Vec::new(),
            curve_preferences: Vec::new(),
            sni_strict: false,
            alpn_protocols: vec![
                "h2".to_string(),
                "http/1.1".to_string(),
                ACME_TLS_ALPN_STORE.to_string(),
            ],
            disable_session_tickets: false,
            client_auth: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientAuth {
    pub ca_files: Vec<String>,
    pub client_auth_type: String,
}
