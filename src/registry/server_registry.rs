//! Thread-safe server pool storage using DashMap.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::balancer::Server;

/// Thread-safe storage for per-service server pools.
///
/// Requests read snapshots concurrently; `replace_all` swaps the whole set.
pub struct ServerRegistry {
    pools: DashMap<String, Vec<Server>>,
}

impl ServerRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    /// Replaces every pool, dropping services not present in `pools`.
    pub fn replace_all(&self, pools: HashMap<String, Vec<Server>>) {
        self.pools.retain(|service, _| pools.contains_key(service));
        for (service, servers) in pools {
            self.pools.insert(service, servers);
        }
    }

    /// Returns a snapshot of a service's pool. Unknown services have an empty pool.
    pub fn servers(&self, service: &str) -> Vec<Server> {
        self.pools
            .get(service)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Returns whether `service` has a pool, even an empty one.
    pub fn contains(&self, service: &str) -> bool {
        self.pools.contains_key(service)
    }

    /// Returns the number of services with a pool.
    pub fn service_count(&self) -> usize {
        self.pools.len()
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
