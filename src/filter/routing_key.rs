//! Header-driven routing key filter.

use http::HeaderName;
use pingora_http::RequestHeader;

use crate::context::RequestContext;

use super::RequestFilter;

pub const DEFAULT_HEADER: &str = "X-Canary-Test";
pub const DEFAULT_EXPECTED_VALUE: &str = "true";
pub const DEFAULT_ROUTING_KEY: &str = "canary";

/// Tags requests carrying a marker header with a routing key.
///
/// The filter always runs. When the header is present and its first value
/// equals the expected value (ASCII case-insensitive, no trimming), the
/// routing key is written to the context. Anything else leaves the context
/// unchanged.
#[derive(Debug, Clone)]
pub struct RoutingKeyFilter {
    header: HeaderName,
    expected_value: String,
    routing_key: String,
    order: i32,
}

impl RoutingKeyFilter {
    /// Creates a filter writing `routing_key` when `header` equals `expected_value`.
    pub fn new(
        header: HeaderName,
        expected_value: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            header,
            expected_value: expected_value.into(),
            routing_key: routing_key.into(),
            order: 0,
        }
    }

    /// Sets the filter's position in the chain.
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// The routing key this filter writes.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Returns true if the request carries the marker header with the expected value.
    pub fn matches(&self, req: &RequestHeader) -> bool {
        req.headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case(&self.expected_value))
            .unwrap_or(false)
    }
}

impl Default for RoutingKeyFilter {
    fn default() -> Self {
        Self::new(
            HeaderName::from_static("x-canary-test"),
            DEFAULT_EXPECTED_VALUE,
            DEFAULT_ROUTING_KEY,
        )
    }
}

impl RequestFilter for RoutingKeyFilter {
    fn name(&self) -> &str {
        "routing-key"
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn apply(&self, req: &RequestHeader, ctx: &mut RequestContext) {
        if self.matches(req) {
            tracing::debug!(
                header = self.header.as_str(),
                routing_key = %self.routing_key,
                "request tagged with routing key"
            );
            ctx.set_routing_key(self.routing_key.clone());
        }
    }
}
