//! Pre-routing request filters.
//!
//! Filters run from the proxy's `request_filter` phase, before any upstream
//! is selected, and record their decisions in the request's `RequestContext`.

mod routing_key;

use std::sync::Arc;

use pingora_http::RequestHeader;

use crate::context::RequestContext;

pub use routing_key::{
    RoutingKeyFilter, DEFAULT_EXPECTED_VALUE, DEFAULT_HEADER, DEFAULT_ROUTING_KEY,
};

/// A step of the pre-routing filter chain.
pub trait RequestFilter: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Position in the chain. Lower runs first.
    fn order(&self) -> i32 {
        0
    }

    /// Whether the filter applies to this request. Defaults to always.
    fn should_run(&self, _req: &RequestHeader) -> bool {
        true
    }

    /// Inspects the request and records its decision in `ctx`.
    fn apply(&self, req: &RequestHeader, ctx: &mut RequestContext);
}

/// Ordered list of request filters.
///
/// Filters are kept sorted by `order()`; equal orders keep registration
/// order. When two filters write the routing key, the later one wins.
#[derive(Default, Clone)]
pub struct FilterChain {
    filters: Vec<Arc<dyn RequestFilter>>,
}

impl FilterChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter at the position given by its order.
    pub fn with(mut self, filter: Arc<dyn RequestFilter>) -> Self {
        self.push(filter);
        self
    }

    /// Inserts a filter after every filter with the same or a lower order.
    pub fn push(&mut self, filter: Arc<dyn RequestFilter>) {
        let pos = self
            .filters
            .iter()
            .position(|f| f.order() > filter.order())
            .unwrap_or(self.filters.len());
        self.filters.insert(pos, filter);
    }

    /// Number of filters in the chain.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns true if the chain has no filters.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Filter names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Runs every filter whose `should_run` holds against the request.
    pub fn run(&self, req: &RequestHeader, ctx: &mut RequestContext) {
        for filter in &self.filters {
            if !filter.should_run(req) {
                continue;
            }

            let before = ctx.routing_key().map(str::to_string);
            filter.apply(req, ctx);

            if let (Some(prev), Some(now)) = (before.as_deref(), ctx.routing_key()) {
                if prev != now {
                    tracing::debug!(
                        filter = filter.name(),
                        previous = prev,
                        routing_key = now,
                        "routing key replaced"
                    );
                }
            }
        }
    }
}
