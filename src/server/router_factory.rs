//! Turning a merged configuration into live routers.
//!
//! [`RouterFactory`] is the seam between configuration and traffic. The
//! built-in [`DefaultRouterFactory`] is small: it understands
//! literal `HostSNI(...)` TCP rules and UDP routers, forwards both with a
//! round-robin proxy, and answers 404 to HTTP. Anything else is skipped with
//! a debug log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::dynamic::{
    Configuration, TcpConfiguration, TcpRouter as TcpRouterConfig, UdpConfiguration,
};
use crate::config::schema::{Protocol, StaticConfig};
use crate::http::response::not_found_router;
use crate::net::tls::build_server_config;
use crate::tcp::router::ANY_SNI;
use crate::tcp::{TcpHandler, TcpProxy, TcpRouter};
use crate::udp::{UdpHandler, UdpProxy};
use crate::watcher::merge::qualify_reference;

/// Routers for every entry point a configuration targets, by entry point name.
#[derive(Default)]
pub struct Routers {
    pub tcp: HashMap<String, TcpRouter>,
    pub udp: HashMap<String, Arc<dyn UdpHandler>>,
}

/// Builds routers from a merged configuration.
pub trait RouterFactory: Send + Sync {
    fn create_routers(&self, conf: &Configuration) -> Routers;
}

/// Router factory of the stock binary.
#[derive(Debug, Clone, Default)]
pub struct DefaultRouterFactory {
    tcp_entry_points: Vec<String>,
    udp_entry_points: Vec<String>,
}

impl DefaultRouterFactory {
    pub fn new(static_config: &StaticConfig) -> Self {
        let mut factory = Self::default();
        for (name, entry_point) in &static_config.entry_points {
            match entry_point.parse_address() {
                Ok((_, Protocol::Tcp)) => factory.tcp_entry_points.push(name.clone()),
                Ok((_, Protocol::Udp)) => factory.udp_entry_points.push(name.clone()),
                Err(_) => {}
            }
        }
        factory
    }

    fn tcp_routes(&self, tcp: &TcpConfiguration, routers: &mut HashMap<String, TcpRouter>) {
        let mut ordered: Vec<(&String, &TcpRouterConfig)> = tcp.routers.iter().collect();
        // Ascending, so the highest priority router wins a shared SNI.
        ordered.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then(b.0.cmp(a.0)));

        for (name, config) in ordered {
            let Some(hosts) = parse_host_sni(&config.rule) else {
                tracing::debug!(router = %name, rule = %config.rule, "Unsupported TCP rule, skipping router");
                continue;
            };
            if config.tls.as_ref().is_some_and(|tls| !tls.passthrough) {
                tracing::debug!(router = %name, "TLS termination on TCP routers is not supported, skipping router");
                continue;
            }
            let Some(proxy) = tcp_proxy(tcp, name, &config.service) else {
                tracing::debug!(router = %name, service = %config.service, "TCP service not found or empty");
                continue;
            };
            let handler: Arc<dyn TcpHandler> = Arc::new(proxy);

            for entry_point in &config.entry_points {
                let Some(router) = routers.get_mut(entry_point) else {
                    tracing::debug!(router = %name, entry_point = %entry_point, "Unknown TCP entry point");
                    continue;
                };
                for host in &hosts {
                    // Plain TCP without TLS needs no SNI to be routed.
                    if host == ANY_SNI && config.tls.is_none() {
                        router.set_catch_all(handler.clone());
                    } else {
                        router.add_sni_route(host, handler.clone());
                    }
                }
            }
        }
    }

    fn udp_routes(&self, udp: &UdpConfiguration) -> HashMap<String, Arc<dyn UdpHandler>> {
        let mut handlers: HashMap<String, Arc<dyn UdpHandler>> = HashMap::new();
        for (name, config) in &udp.routers {
            let service = qualify_reference(provider_of(name), &config.service);
            let servers: Vec<String> = udp
                .services
                .get(&service)
                .and_then(|s| s.load_balancer.as_ref())
                .map(|lb| lb.servers.iter().map(|s| s.address.clone()).collect())
                .unwrap_or_default();
            if servers.is_empty() {
                tracing::debug!(router = %name, service = %service, "UDP service not found or empty");
                continue;
            }

            let handler: Arc<dyn UdpHandler> = Arc::new(UdpProxy::new(servers));
            for entry_point in &config.entry_points {
                if !self.udp_entry_points.contains(entry_point) {
                    tracing::debug!(router = %name, entry_point = %entry_point, "Unknown UDP entry point");
                    continue;
                }
                if handlers.contains_key(entry_point) {
                    tracing::warn!(router = %name, entry_point = %entry_point, "UDP entry point already has a router");
                    continue;
                }
                handlers.insert(entry_point.clone(), handler.clone());
            }
        }
        handlers
    }
}

impl RouterFactory for DefaultRouterFactory {
    fn create_routers(&self, conf: &Configuration) -> Routers {
        let tls_config = match conf.tls.as_ref().map(build_server_config).transpose() {
            Ok(config) => config.flatten(),
            Err(e) => {
                tracing::error!(error = %e, "Invalid TLS configuration, serving without certificates");
                None
            }
        };

        let mut tcp: HashMap<String, TcpRouter> = self
            .tcp_entry_points
            .iter()
            .map(|name| {
                let mut router = TcpRouter::new();
                router.set_http_handler(http_handler());
                if let Some(tls) = &tls_config {
                    router.set_tls_config(tls.clone());
                }
                (name.clone(), router)
            })
            .collect();

        if let Some(http) = &conf.http {
            if !http.routers.is_empty() {
                tracing::debug!(routers = http.routers.len(), "HTTP rules are not evaluated, answering 404");
            }
        }
        if let Some(tcp_conf) = &conf.tcp {
            self.tcp_routes(tcp_conf, &mut tcp);
        }
        let udp = conf
            .udp
            .as_ref()
            .map(|udp| self.udp_routes(udp))
            .unwrap_or_default();

        Routers { tcp, udp }
    }
}

/// HTTP handler of every TCP entry point: 404 with request IDs and request
/// tracing.
fn http_handler() -> axum::Router {
    not_found_router()
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

fn provider_of(qualified: &str) -> &str {
    qualified.rsplit_once('@').map(|(_, p)| p).unwrap_or_default()
}

fn tcp_proxy(tcp: &TcpConfiguration, router: &str, service: &str) -> Option<TcpProxy> {
    let provider = provider_of(router);
    let service = qualify_reference(provider, service);
    let lb = tcp.services.get(&service)?.load_balancer.as_ref()?;
    let servers: Vec<String> = lb.servers.iter().map(|s| s.address.clone()).collect();
    if servers.is_empty() {
        return None;
    }

    let mut proxy = TcpProxy::new(servers);
    if !lb.servers_transport.is_empty() {
        let transport = qualify_reference(provider, &lb.servers_transport);
        if let Some(ms) = tcp
            .servers_transports
            .get(&transport)
            .and_then(|t| t.dial_timeout_ms)
        {
            proxy = proxy.with_dial_timeout(Duration::from_millis(ms));
        }
    }
    Some(proxy)
}

/// Hosts of a rule made of one `HostSNI(...)` matcher with literal
/// arguments, e.g. ``HostSNI(`a.example.com`, `b.example.com`)``.
pub fn parse_host_sni(rule: &str) -> Option<Vec<String>> {
    let args = rule
        .trim()
        .strip_prefix("HostSNI(")?
        .strip_suffix(')')?;

    let hosts: Vec<String> = args
        .split(',')
        .map(|arg| {
            let arg = arg.trim();
            arg.strip_prefix('`')
                .and_then(|a| a.strip_suffix('`'))
                .or_else(|| arg.strip_prefix('"').and_then(|a| a.strip_suffix('"')))
                .map(str::to_string)
        })
        .collect::<Option<_>>()?;

    if hosts.is_empty() || hosts.iter().any(|h| h.is_empty() || h.contains(['`', '"', '('])) {
        return None;
    }
    Some(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::dynamic::{
        TcpServer, TcpServersLoadBalancer, TcpService, UdpRouter, UdpServer,
        UdpServersLoadBalancer, UdpService,
    };
    use crate::config::schema::EntryPointConfig;
    use crate::net::clienthello::ClientHello;
    use crate::tcp::router::Route;

    fn static_config() -> StaticConfig {
        let mut config = StaticConfig::default();
        for (name, address) in [("web", ":80"), ("db", ":5432"), ("dns", ":53/udp")] {
            config.entry_points.insert(
                name.to_string(),
                EntryPointConfig {
                    address: address.to_string(),
                    ..Default::default()
                },
            );
        }
        config
    }

    fn tcp_conf(rule: &str) -> Configuration {
        let mut tcp = TcpConfiguration::default();
        tcp.routers.insert(
            "pg@file".to_string(),
            TcpRouterConfig {
                entry_points: vec!["db".to_string()],
                service: "pg".to_string(),
                rule: rule.to_string(),
                ..Default::default()
            },
        );
        tcp.services.insert(
            "pg@file".to_string(),
            TcpService {
                load_balancer: Some(TcpServersLoadBalancer {
                    servers: vec![TcpServer {
                        address: "127.0.0.1:5433".to_string(),
                        ..Default::default()
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

    #[test]
    fn parses_literal_host_sni() {
        assert_eq!(parse_host_sni("HostSNI(`*`)"), Some(vec!["*".to_string()]));
        assert_eq!(
            parse_host_sni("HostSNI(`a.example.com`, `b.example.com`)"),
            Some(vec!["a.example.com".to_string(), "b.example.com".to_string()])
        );
        assert_eq!(parse_host_sni("HostSNI(`a`) || ClientIP(`10.0.0.1`)"), None);
        assert_eq!(parse_host_sni("Host(`a`)"), None);
        assert_eq!(parse_host_sni("HostSNI()"), None);
    }

    #[test]
    fn every_tcp_entry_point_gets_a_router() {
        let factory = DefaultRouterFactory::new(&static_config());
        let routers = factory.create_routers(&Configuration::empty_sections());
        let mut names: Vec<_> = routers.tcp.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["db".to_string(), "web".to_string()]);
        assert!(routers.udp.is_empty());
        assert!(routers.tcp["web"].http_handler().is_some());
    }

    #[test]
    fn wildcard_host_sni_without_tls_is_catch_all() {
        let factory = DefaultRouterFactory::new(&static_config());
        let routers = factory.create_routers(&tcp_conf("HostSNI(`*`)"));
        let db = &routers.tcp["db"];
        assert!(matches!(db.select(&ClientHello::default()), Route::Tcp(_)));
        assert!(matches!(routers.tcp["web"].select(&ClientHello::default()), Route::Close));
    }

    #[test]
    fn named_host_sni_routes_tls_only() {
        let factory = DefaultRouterFactory::new(&static_config());
        let routers = factory.create_routers(&tcp_conf("HostSNI(`pg.example.com`)"));
        let db = &routers.tcp["db"];
        let hello = ClientHello {
            is_tls: true,
            server_name: Some("pg.example.com".to_string()),
            alpn: Vec::new(),
        };
        assert!(matches!(db.select(&hello), Route::Tcp(_)));
    }

    #[test]
    fn udp_router_targets_udp_entry_point() {
        let mut udp = UdpConfiguration::default();
        udp.routers.insert(
            "dns@file".to_string(),
            UdpRouter {
                entry_points: vec!["dns".to_string(), "web".to_string()],
                service: "resolver".to_string(),
            },
        );
        udp.services.insert(
            "resolver@file".to_string(),
            UdpService {
                load_balancer: Some(UdpServersLoadBalancer {
                    servers: vec![UdpServer {
                        address: "127.0.0.1:5353".to_string(),
                    }],
                }),
                ..Default::default()
            },
        );
        let conf = Configuration {
            udp: Some(udp),
            ..Default::default()
        };

        let routers = DefaultRouterFactory::new(&static_config()).create_routers(&conf);
        assert_eq!(routers.udp.len(), 1);
        assert!(routers.udp.contains_key("dns"));
    }
}
