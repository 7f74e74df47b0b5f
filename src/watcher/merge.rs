//! Multi-provider configuration merging.
//!
//! Pure and deterministic: the same provider map always yields the same
//! merged configuration, and nothing here touches shared state.

use tracing::{debug, error, warn};

use crate::config::dynamic::{
    Configuration, Configurations, HttpConfiguration, TcpConfiguration, TlsConfiguration,
    TlsOptions, UdpConfiguration, ACME_TLS_ALPN_PROVIDER, ACME_TLS_ALPN_STORE, DEFAULT_TLS_NAME,
};
use crate::watcher::model::apply_model;

/// Qualify an element name with its provider: `name@provider`.
pub fn qualified_name(provider: &str, name: &str) -> String {
    format!("{}@{}", name, provider)
}

/// Qualify a reference unless it already names a provider.
pub fn qualify_reference(provider: &str, reference: &str) -> String {
    if reference.contains('@') {
        reference.to_string()
    } else {
        qualified_name(provider, reference)
    }
}

/// Merge every provider configuration into one namespaced configuration.
///
/// Routers that declare no entry points receive `default_entry_points`
/// (HTTP routers only when they also have no parent). The literal `default`
/// TLS store and options stay unqualified; when several providers define
/// one, it is dropped rather than picked arbitrarily.
pub fn merge_configuration(
    configurations: &Configurations,
    default_entry_points: &[String],
) -> Configuration {
    let mut http = HttpConfiguration::default();
    let mut tcp = TcpConfiguration::default();
    let mut udp = UdpConfiguration::default();
    let mut tls = TlsConfiguration::default();

    let mut default_store_providers: Vec<&str> = Vec::new();
    let mut default_options_providers: Vec<&str> = Vec::new();

    for (provider, conf) in configurations {
        let provider = provider.as_str();

        if let Some(src) = &conf.http {
            merge_http(provider, src, default_entry_points, &mut http);
        }

        if let Some(src) = &conf.tcp {
            merge_tcp(provider, src, default_entry_points, &mut tcp);
        }

        if let Some(src) = &conf.udp {
            for (name, router) in &src.routers {
                let mut router = router.clone();
                if router.entry_points.is_empty() {
                    router.entry_points = default_entry_points.to_vec();
                }
                udp.routers.insert(qualified_name(provider, name), router);
            }
            for (name, service) in &src.services {
                udp.services
                    .insert(qualified_name(provider, name), service.clone());
            }
        }

        if let Some(src) = &conf.tls {
            for cert in &src.certificates {
                if cert.stores.iter().any(|s| s == ACME_TLS_ALPN_STORE)
                    && provider != ACME_TLS_ALPN_PROVIDER
                {
                    debug!(
                        provider = %provider,
                        "Skipping certificate targeting the ACME TLS-ALPN store"
                    );
                    continue;
                }
                tls.certificates.push(cert.clone());
            }

            for (name, store) in &src.stores {
                if name == DEFAULT_TLS_NAME {
                    default_store_providers.push(provider);
                    tls.stores.insert(name.clone(), store.clone());
                    continue;
                }
                tls.stores
                    .insert(qualified_name(provider, name), store.clone());
            }

            for (name, options) in &src.options {
                if name == DEFAULT_TLS_NAME {
                    default_options_providers.push(provider);
                    tls.options.insert(name.clone(), options.clone());
                    continue;
                }
                tls.options
                    .insert(qualified_name(provider, name), options.clone());
            }
        }
    }

    if default_store_providers.len() > 1 {
        error!(
            providers = ?default_store_providers,
            "Default TLS store defined by multiple providers, ignoring all of them"
        );
        tls.stores.remove(DEFAULT_TLS_NAME);
    }

    if default_options_providers.is_empty() {
        tls.options
            .insert(DEFAULT_TLS_NAME.to_string(), TlsOptions::default());
    } else if default_options_providers.len() > 1 {
        warn!(
            providers = ?default_options_providers,
            "Default TLS options defined by multiple providers, ignoring all of them"
        );
        tls.options.remove(DEFAULT_TLS_NAME);
    }

    apply_model(Configuration {
        http: Some(http),
        tcp: Some(tcp),
        udp: Some(udp),
        tls: Some(tls),
    })
}

fn merge_http(
    provider: &str,
    src: &HttpConfiguration,
    default_entry_points: &[String],
    dst: &mut HttpConfiguration,
) {
    for (name, router) in &src.routers {
        let mut router = router.clone();
        if router.entry_points.is_empty() && router.parent_refs.is_empty() {
            debug!(
                router = %name,
                provider = %provider,
                entry_points = ?default_entry_points,
                "No entry point defined, using default entry points"
            );
            router.entry_points = default_entry_points.to_vec();
        }
        router.parent_refs = router
            .parent_refs
            .iter()
            .map(|r| qualify_reference(provider, r))
            .collect();
        dst.routers.insert(qualified_name(provider, name), router);
    }
    for (name, middleware) in &src.middlewares {
        dst.middlewares
            .insert(qualified_name(provider, name), middleware.clone());
    }
    for (name, service) in &src.services {
        dst.services
            .insert(qualified_name(provider, name), service.clone());
    }
    for (name, model) in &src.models {
        dst.models.insert(qualified_name(provider, name), model.clone());
    }
    for (name, transport) in &src.servers_transports {
        dst.servers_transports
            .insert(qualified_name(provider, name), transport.clone());
    }
}

fn merge_tcp(
    provider: &str,
    src: &TcpConfiguration,
    default_entry_points: &[String],
    dst: &mut TcpConfiguration,
) {
    for (name, router) in &src.routers {
        let mut router = router.clone();
        if router.entry_points.is_empty() {
            debug!(
                router = %name,
                provider = %provider,
                entry_points = ?default_entry_points,
                "No entry point defined, using default entry points"
            );
            router.entry_points = default_entry_points.to_vec();
        }
        dst.routers.insert(qualified_name(provider, name), router);
    }
    for (name, middleware) in &src.middlewares {
        dst.middlewares
            .insert(qualified_name(provider, name), middleware.clone());
    }
    for (name, service) in &src.services {
        dst.services
            .insert(qualified_name(provider, name), service.clone());
    }
    for (name, model) in &src.models {
        dst.models.insert(qualified_name(provider, name), model.clone());
    }
    for (name, transport) in &src.servers_transports {
        dst.servers_transports
            .insert(qualified_name(provider, name), transport.clone());
    }
}
