//! Model application on merged configuration.
//!
//! A model named `<entryPoint>@internal` is a router template: every root
//! router attached to that entry point gets a copy restricted to it, with the
//! model's middlewares in front and its TLS/observability settings filling
//! whatever the router left unset.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::dynamic::{
    Configuration, Model, Router, RouterObservabilityConfig, TcpConfiguration, TraceVerbosity,
};

const INTERNAL_SUFFIX: &str = "@internal";

/// Expand models into routers, then fill observability defaults and TCP rule
/// syntax.
pub fn apply_model(mut conf: Configuration) -> Configuration {
    if let Some(http) = conf.http.as_mut() {
        if !http.models.is_empty() {
            http.routers = expand_routers(&http.routers, &http.models);
        }
        apply_default_observability(&mut http.routers);
    }

    if let Some(tcp) = conf.tcp.as_mut() {
        apply_tcp_model(tcp);
    }

    conf
}

fn expand_routers(
    routers: &BTreeMap<String, Router>,
    models: &BTreeMap<String, Model>,
) -> BTreeMap<String, Router> {
    // At most one internal model is expected to carry a rule syntax, so the
    // first one found wins.
    let internal_syntax = models
        .iter()
        .find(|(name, _)| name.ends_with(INTERNAL_SUFFIX))
        .map(|(_, model)| model.default_rule_syntax.clone());

    let mut expanded: BTreeMap<String, Router> = BTreeMap::new();
    let mut renamed: HashMap<String, Vec<String>> = HashMap::new();

    for (name, router) in routers {
        if !router.is_root() {
            expanded.insert(name.clone(), router.clone());
            continue;
        }

        let mut router = router.clone();
        if !router.default_rule && router.rule_syntax.is_empty() {
            if let Some(syntax) = &internal_syntax {
                router.rule_syntax = syntax.clone();
            }
        }

        let entry_points = std::mem::take(&mut router.entry_points);
        for ep in &entry_points {
            let Some(model) = models.get(&format!("{}{}", ep, INTERNAL_SUFFIX)) else {
                router.entry_points.push(ep.clone());
                expanded.insert(name.clone(), router.clone());
                continue;
            };

            let mut derived = router.clone();
            derived.entry_points = vec![ep.clone()];
            if derived.tls.is_none() {
                derived.tls = model.tls.clone();
            }
            derived.middlewares = model
                .middlewares
                .iter()
                .chain(router.middlewares.iter())
                .cloned()
                .collect();
            inherit_observability(
                derived.observability.get_or_insert_with(Default::default),
                &model.observability,
            );

            let derived_name = if entry_points.len() > 1 {
                let derived_name = format!("{}-{}", ep, name);
                renamed
                    .entry(name.clone())
                    .or_default()
                    .push(derived_name.clone());
                derived_name
            } else {
                name.clone()
            };
            expanded.insert(derived_name, derived);
        }
    }

    // Children pointing at a split router point at every clone instead.
    // Other references, dangling ones included, are left alone.
    let names: HashSet<String> = expanded.keys().cloned().collect();
    for router in expanded.values_mut() {
        if router.is_root() {
            continue;
        }
        let mut parent_refs = Vec::with_capacity(router.parent_refs.len());
        for reference in &router.parent_refs {
            match renamed.get(reference) {
                Some(clones) => {
                    // Kept under its own name for entry points without a model.
                    if names.contains(reference) {
                        parent_refs.push(reference.clone());
                    }
                    parent_refs.extend(clones.iter().cloned());
                }
                None => parent_refs.push(reference.clone()),
            }
        }
        router.parent_refs = parent_refs;
    }

    expanded
}

fn inherit_observability(target: &mut RouterObservabilityConfig, model: &RouterObservabilityConfig) {
    if target.access_logs.is_none() {
        target.access_logs = model.access_logs;
    }
    if target.metrics.is_none() {
        target.metrics = model.metrics;
    }
    if target.tracing.is_none() {
        target.tracing = model.tracing;
    }
    if target.trace_verbosity.is_none() {
        target.trace_verbosity = model.trace_verbosity;
    }
}

/// Enable every unset observability signal on root routers. Idempotent.
pub fn apply_default_observability(routers: &mut BTreeMap<String, Router>) {
    for router in routers.values_mut().filter(|r| r.is_root()) {
        let obs = router.observability.get_or_insert_with(Default::default);
        obs.access_logs.get_or_insert(true);
        obs.metrics.get_or_insert(true);
        obs.tracing.get_or_insert(true);
        obs.trace_verbosity.get_or_insert(TraceVerbosity::Minimal);
    }
}

/// TCP routers only inherit the rule syntax; they are never split.
fn apply_tcp_model(tcp: &mut TcpConfiguration) {
    let Some(syntax) = tcp
        .models
        .iter()
        .find(|(name, _)| name.ends_with(INTERNAL_SUFFIX))
        .map(|(_, model)| model.default_rule_syntax.clone())
    else {
        return;
    };

    for router in tcp.routers.values_mut() {
        if router.rule_syntax.is_empty() {
            router.rule_syntax = syntax.clone();
        }
    }
}
