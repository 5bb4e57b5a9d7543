//! Upstream server selection.
//!
//! A `SelectionRule` picks one server from a candidate pool. Plain rules
//! (`AvailabilityRule`, `RandomRule`) ignore the routing key; `KeyedRule`
//! wraps one of them and overrides the choice for pinned routing keys.

mod keyed;
mod random;
mod upstream;

use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;

pub use crate::error::SelectionError;

pub use keyed::{KeyedRule, PinnedServer};
pub use random::RandomRule;
pub use upstream::{AvailabilityRule, HealthStatus, HealthTracker};

/// A backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Server {
    host: String,
    port: u16,
    weight: u32,
}

impl Server {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
        }
    }

    /// Sets the relative weight. Zero is treated as one by the rules.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Returns "host:port", bracketing IPv6 hosts.
    pub fn address(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Server {
    type Err = GatewayError;

    /// Parses "host:port" or "[ipv6]:port".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| GatewayError::InvalidAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
            let port = tail.strip_prefix(':').ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else {
            s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port.parse::<u16>().map_err(|e| invalid(&e.to_string()))?;

        Ok(Server::new(host, port))
    }
}

/// Chooses a server for a request.
pub trait SelectionRule: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Chooses a server from `pool` for a request carrying `key`.
    ///
    /// `Ok(None)` means no server is currently eligible.
    fn choose(&self, key: Option<&str>, pool: &[Server]) -> Result<Option<Server>, SelectionError>;

    /// Whether `key` selects a pinned target rather than a pool member.
    ///
    /// Pinned targets are kept out of the pool's health accounting.
    fn is_pinned(&self, _key: Option<&str>) -> bool {
        false
    }
}

/// Largest server weight accepted from configuration.
pub const MAX_WEIGHT: u32 = 10_000;

/// Sum of the selection weights of `servers` (zero counts as one).
pub(crate) fn total_weight(servers: &[&Server]) -> u64 {
    servers.iter().map(|s| u64::from(s.weight.max(1))).sum()
}

/// Returns the server covering `point` on the cumulative weight line.
///
/// `point` must be below `total_weight(servers)`.
pub(crate) fn weighted_pick<'a>(servers: &[&'a Server], mut point: u64) -> Option<&'a Server> {
    for server in servers {
        let weight = u64::from(server.weight.max(1));
        if point < weight {
            return Some(*server);
        }
        point -= weight;
    }
    None
}
