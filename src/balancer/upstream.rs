//! Availability-aware load balancing and health tracking.
//!
//! `AvailabilityRule` is the default fallback rule: weighted round-robin over
//! the servers that are currently available. A server is unavailable while its
//! circuit is tripped (too many consecutive connect failures) or while it has
//! reached the in-flight request limit. When nothing is available the rule
//! returns `None` instead of forcing a pick.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::SelectionError;

use super::{total_weight, weighted_pick, SelectionRule, Server};

/// Health status of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Tracks health and in-flight requests per server address.
///
/// Thread-safe via DashMap. Unknown servers are considered healthy.
/// After `failure_threshold` consecutive failures, a server is marked unhealthy.
/// A single success restores it.
pub struct HealthTracker {
    health: DashMap<String, HealthStatus>,
    failures: DashMap<String, u32>,
    active: DashMap<String, u32>,
    failure_threshold: u32,
}

impl HealthTracker {
    /// Creates a new HealthTracker with the given failure threshold.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            health: DashMap::new(),
            failures: DashMap::new(),
            active: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Records a successful connection. Resets the failure count.
    pub fn record_success(&self, address: &str) {
        self.failures.insert(address.to_string(), 0);
        self.health.insert(address.to_string(), HealthStatus::Healthy);
    }

    /// Records a failed connection, tripping the circuit at the threshold.
    pub fn record_failure(&self, address: &str) {
        let mut count = self.failures.entry(address.to_string()).or_insert(0);
        *count += 1;

        if *count >= self.failure_threshold {
            self.health
                .insert(address.to_string(), HealthStatus::Unhealthy);
            tracing::warn!(backend = address, failures = *count, "backend marked unhealthy");
        }
    }

    /// Returns false while the server's circuit is tripped.
    pub fn is_healthy(&self, address: &str) -> bool {
        self.health
            .get(address)
            .map(|status| *status == HealthStatus::Healthy)
            .unwrap_or(true)
    }

    /// Marks a request as dispatched to `address`.
    pub fn begin_request(&self, address: &str) {
        *self.active.entry(address.to_string()).or_insert(0) += 1;
    }

    /// Marks a request to `address` as finished.
    pub fn end_request(&self, address: &str) {
        if let Some(mut count) = self.active.get_mut(address) {
            *count = count.saturating_sub(1);
        }
    }

    /// Number of in-flight requests to `address`.
    pub fn active_requests(&self, address: &str) -> u32 {
        self.active.get(address).map(|c| *c).unwrap_or(0)
    }
}

/// Weighted round-robin over available servers.
pub struct AvailabilityRule {
    current: AtomicUsize,
    health_tracker: Arc<HealthTracker>,
    max_active_requests: u32,
}

impl AvailabilityRule {
    /// Creates a rule reading availability from `health_tracker`.
    pub fn new(health_tracker: Arc<HealthTracker>) -> Self {
        Self {
            current: AtomicUsize::new(0),
            health_tracker,
            max_active_requests: 0,
        }
    }

    /// Skips servers with this many in-flight requests. Zero disables the limit.
    pub fn with_max_active_requests(mut self, limit: u32) -> Self {
        self.max_active_requests = limit;
        self
    }

    /// Returns true if `server` is healthy and below the in-flight limit.
    pub fn is_available(&self, server: &Server) -> bool {
        let address = server.address();
        if !self.health_tracker.is_healthy(&address) {
            return false;
        }
        self.max_active_requests == 0
            || self.health_tracker.active_requests(&address) < self.max_active_requests
    }

    /// Selects the next available server.
    pub fn next<'a>(&self, servers: &'a [Server]) -> Option<&'a Server> {
        let available: Vec<&Server> = servers.iter().filter(|s| self.is_available(s)).collect();
        let total = total_weight(&available);
        if total == 0 {
            return None;
        }

        let point = self.current.fetch_add(1, Ordering::Relaxed) as u64 % total;
        weighted_pick(&available, point)
    }
}

impl SelectionRule for AvailabilityRule {
    fn name(&self) -> &'static str {
        "availability"
    }

    fn choose(&self, _key: Option<&str>, pool: &[Server]) -> Result<Option<Server>, SelectionError> {
        Ok(self.next(pool).cloned())
    }
}
