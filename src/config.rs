//! Gateway configuration.
//!
//! Loaded with the `config` crate from an optional file (format picked by
//! extension) layered under `GATEWAY__*` environment variables, e.g.
//! `GATEWAY__LISTEN=0.0.0.0:8080`.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::balancer::{Server, MAX_WEIGHT};
use crate::error::{GatewayError, GatewayResult};
use crate::filter::{DEFAULT_EXPECTED_VALUE, DEFAULT_HEADER, DEFAULT_ROUTING_KEY};
use crate::proxy::PathPattern;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Address for `/healthz` and `/readyz`. Disabled when unset.
    #[serde(default)]
    pub health_listen: Option<String>,
    #[serde(default)]
    pub routing_key_filter: RoutingKeyFilterConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingKeyFilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_header")]
    pub header: String,
    #[serde(default = "default_expected_value")]
    pub expected_value: String,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    /// `/prefix/**`, `/prefix/*` or an exact path.
    pub path: String,
    pub service: String,
    #[serde(default = "default_true")]
    pub strip_prefix: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub rule: FallbackKind,
    /// Consecutive connect failures before a server is skipped.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// In-flight request limit per server. Zero means unlimited.
    #[serde(default)]
    pub max_active_requests: u32,
    /// Routing key -> pinned server address. A null address is published later.
    #[serde(default)]
    pub pinned: HashMap<String, Option<String>>,
}

/// A pool member, either `"host:port"` or `{ address, weight }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerEntry {
    Address(String),
    Weighted { address: String, weight: u32 },
}

impl ServerEntry {
    /// Parses the entry, rejecting weights above `MAX_WEIGHT`.
    pub fn to_server(&self) -> GatewayResult<Server> {
        match self {
            ServerEntry::Address(address) => address.parse(),
            ServerEntry::Weighted { address, weight } => {
                if *weight > MAX_WEIGHT {
                    return Err(GatewayError::InvalidWeight {
                        address: address.clone(),
                        weight: *weight,
                        max: MAX_WEIGHT,
                    });
                }
                Ok(address.parse::<Server>()?.with_weight(*weight))
            }
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_header() -> String {
    DEFAULT_HEADER.to_string()
}

fn default_expected_value() -> String {
    DEFAULT_EXPECTED_VALUE.to_string()
}

fn default_routing_key() -> String {
    DEFAULT_ROUTING_KEY.to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for RoutingKeyFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            header: default_header(),
            expected_value: default_expected_value(),
            routing_key: default_routing_key(),
            order: 0,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            rule: FallbackKind::default(),
            failure_threshold: default_failure_threshold(),
            max_active_requests: 0,
            pinned: HashMap::new(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            health_listen: None,
            routing_key_filter: RoutingKeyFilterConfig::default(),
            routes: Vec::new(),
            services: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from an optional file plus `GATEWAY__*` variables.
    pub fn load(path: Option<&Path>) -> GatewayResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("GATEWAY").separator("__"))
            .build()?
            .try_deserialize::<GatewayConfig>()?;

        config.validate()?;
        tracing::info!(
            routes = config.routes.len(),
            services = config.services.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parses configuration from a string in the given format.
    pub fn parse(source: &str, format: config::FileFormat) -> GatewayResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(source, format))
            .build()?
            .try_deserialize::<GatewayConfig>()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross references and addresses.
    pub fn validate(&self) -> GatewayResult<()> {
        http::HeaderName::try_from(self.routing_key_filter.header.as_str())
            .map_err(|_| GatewayError::InvalidHeader(self.routing_key_filter.header.clone()))?;

        for route in &self.routes {
            PathPattern::parse(&route.path)?;
            if !self.services.contains_key(&route.service) {
                return Err(GatewayError::UnknownService {
                    route: route.id.clone(),
                    service: route.service.clone(),
                });
            }
        }

        for service in self.services.values() {
            for entry in &service.servers {
                entry.to_server()?;
            }
            for address in service.pinned.values().flatten() {
                address.parse::<Server>()?;
            }
        }
        Ok(())
    }
}
