//! Gateway assembly and Pingora server bootstrap.
//!
//! Everything shared between requests (routes, pools, rules, pinned
//! bindings) is built here once, before the proxy service starts. Deferred
//! pins are the only part that changes afterwards, and only from unpublished
//! to published.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use http::HeaderName;
use pingora_core::server::Server as PingoraServer;

use crate::balancer::{
    AvailabilityRule, HealthTracker, KeyedRule, PinnedServer, RandomRule, SelectionRule, Server,
};
use crate::config::{FallbackKind, GatewayConfig, RoutingKeyFilterConfig, ServiceConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::filter::{FilterChain, RoutingKeyFilter};
use crate::proxy::{GatewayProxy, Route, Router, Upstream};
use crate::registry::ServerRegistry;

/// A pinned binding and where it is used.
#[derive(Debug, Clone)]
struct PinEntry {
    service: String,
    key: String,
    pin: PinnedServer,
}

/// All pinned bindings of the gateway.
#[derive(Debug, Clone, Default)]
pub struct PinSet {
    entries: Vec<PinEntry>,
}

impl PinSet {
    /// Records the binding of `key` in `service`.
    pub fn push(&mut self, service: impl Into<String>, key: impl Into<String>, pin: PinnedServer) {
        self.entries.push(PinEntry {
            service: service.into(),
            key: key.into(),
            pin,
        });
    }

    /// Returns the binding of `key` in `service`.
    pub fn get(&self, service: &str, key: &str) -> Option<&PinnedServer> {
        self.entries
            .iter()
            .find(|e| e.service == service && e.key == key)
            .map(|e| &e.pin)
    }

    /// "service/key" for every binding not yet published.
    pub fn pending(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.pin.is_published())
            .map(|e| format!("{}/{}", e.service, e.key))
            .collect()
    }

    /// Returns true when every binding is published.
    pub fn is_ready(&self) -> bool {
        self.entries.iter().all(|e| e.pin.is_published())
    }
}

/// A fully assembled gateway.
pub struct Gateway {
    proxy: GatewayProxy,
    pins: PinSet,
}

impl Gateway {
    /// Builds the gateway described by `config`.
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;

        let mut names: Vec<&String> = config.services.keys().collect();
        names.sort();

        let mut pools = HashMap::new();
        let mut upstreams = HashMap::new();
        let mut pins = PinSet::default();

        for name in names {
            let service = &config.services[name];
            let servers = service
                .servers
                .iter()
                .map(|entry| entry.to_server())
                .collect::<GatewayResult<Vec<Server>>>()?;

            let tracker = Arc::new(HealthTracker::new(service.failure_threshold));
            let rule = build_rule(name, service, &tracker, &mut pins)?;

            tracing::debug!(
                service = name.as_str(),
                servers = servers.len(),
                rule = rule.name(),
                "service configured"
            );
            pools.insert(name.clone(), servers);
            upstreams.insert(name.clone(), Upstream::new(rule, tracker));
        }

        let registry = Arc::new(ServerRegistry::new());
        registry.replace_all(pools);

        let routes = config
            .routes
            .iter()
            .map(|r| Route::new(r.id.clone(), &r.path, r.service.clone(), r.strip_prefix))
            .collect::<GatewayResult<Vec<_>>>()?;

        let filters = build_filters(&config.routing_key_filter)?;
        tracing::debug!(filters = ?filters.names(), "filter chain built");

        Ok(Self {
            proxy: GatewayProxy::new(Router::new(routes), filters, registry, upstreams),
            pins,
        })
    }

    pub fn proxy(&self) -> &GatewayProxy {
        &self.proxy
    }

    pub fn pins(&self) -> &PinSet {
        &self.pins
    }

    /// Returns a publish handle for a pinned binding.
    pub fn pin(&self, service: &str, key: &str) -> Option<PinnedServer> {
        self.pins.get(service, key).cloned()
    }

    /// Splits the gateway into the proxy to serve and the pins to report on.
    pub fn into_parts(self) -> (GatewayProxy, PinSet) {
        (self.proxy, self.pins)
    }
}

fn build_rule(
    name: &str,
    service: &ServiceConfig,
    tracker: &Arc<HealthTracker>,
    pins: &mut PinSet,
) -> GatewayResult<Arc<dyn SelectionRule>> {
    let fallback: Arc<dyn SelectionRule> = match service.rule {
        FallbackKind::RoundRobin => Arc::new(
            AvailabilityRule::new(Arc::clone(tracker))
                .with_max_active_requests(service.max_active_requests),
        ),
        FallbackKind::Random => Arc::new(RandomRule::new()),
    };

    if service.pinned.is_empty() {
        return Ok(fallback);
    }

    let mut keys: Vec<&String> = service.pinned.keys().collect();
    keys.sort();

    let mut rule = KeyedRule::new(fallback);
    for key in keys {
        let pin = match &service.pinned[key] {
            Some(address) => PinnedServer::published(address.parse()?),
            None => PinnedServer::unpublished(),
        };
        pins.push(name, key.as_str(), pin.clone());
        rule = rule.with_pin(key.as_str(), pin);
    }
    Ok(Arc::new(rule))
}

fn build_filters(config: &RoutingKeyFilterConfig) -> GatewayResult<FilterChain> {
    let mut chain = FilterChain::new();
    if config.enabled {
        let header = HeaderName::try_from(config.header.as_str())
            .map_err(|_| GatewayError::InvalidHeader(config.header.clone()))?;
        chain.push(Arc::new(
            RoutingKeyFilter::new(header, &config.expected_value, &config.routing_key)
                .with_order(config.order),
        ));
    }
    Ok(chain)
}

/// Creates a Pingora server running `proxy` on `listen`.
pub fn build_server(proxy: GatewayProxy, listen: &str) -> Result<PingoraServer> {
    let mut server = PingoraServer::new(None)?;
    server.bootstrap();

    let mut service = pingora_proxy::http_proxy_service(&server.configuration, proxy);
    service.add_tcp(listen);
    server.add_service(service);

    tracing::info!(listen = listen, "gateway listening");
    Ok(server)
}
