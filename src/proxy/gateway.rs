//! Pingora ProxyHttp implementation for the gateway.
//!
//! Request lifecycle:
//! 1. `new_ctx` creates a fresh `GatewayCtx` (and so a fresh `RequestContext`).
//! 2. `request_filter` runs the filter chain, which may set a routing key.
//! 3. `upstream_peer` routes the path to a service, reads the routing key
//!    from the context, asks the service's selection rule for a server and
//!    resolves its address.
//! 4. `upstream_request_filter` rewrites the forwarded path.
//! 5. `logging` records the outcome and clears the context.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::RequestHeader;
use pingora_proxy::{ProxyHttp, Session};

use crate::balancer::{HealthTracker, SelectionRule, Server};
use crate::context::RequestContext;
use crate::error::SelectionError;
use crate::filter::FilterChain;
use crate::registry::ServerRegistry;

use super::router::{RouteMatch, Router};

pub const FORWARDED_PREFIX_HEADER: &str = "X-Forwarded-Prefix";

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-request context for the gateway proxy.
#[derive(Default)]
pub struct GatewayCtx {
    /// Attributes written by the filter chain, including the routing key.
    pub request: RequestContext,
    /// The route matched in `upstream_peer`.
    pub route: Option<RouteMatch>,
    /// The backend address selected for this request.
    pub backend_address: Option<String>,
    /// Whether the backend is a pinned target, which is not health tracked.
    pub pinned: bool,
}

/// Selection rule and health state of one service.
pub struct Upstream {
    rule: Arc<dyn SelectionRule>,
    health_tracker: Arc<HealthTracker>,
}

impl Upstream {
    pub fn new(rule: Arc<dyn SelectionRule>, health_tracker: Arc<HealthTracker>) -> Self {
        Self {
            rule,
            health_tracker,
        }
    }

    pub fn rule(&self) -> &Arc<dyn SelectionRule> {
        &self.rule
    }
}

/// Gateway proxy that routes HTTP requests to backends.
pub struct GatewayProxy {
    router: Router,
    filters: FilterChain,
    registry: Arc<ServerRegistry>,
    upstreams: HashMap<String, Upstream>,
}

impl GatewayProxy {
    pub fn new(
        router: Router,
        filters: FilterChain,
        registry: Arc<ServerRegistry>,
        upstreams: HashMap<String, Upstream>,
    ) -> Self {
        Self {
            router,
            filters,
            registry,
            upstreams,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn upstream(&self, service: &str) -> Option<&Upstream> {
        self.upstreams.get(service)
    }

    /// Chooses the server for a routed request carrying `key`.
    ///
    /// An unpublished pin and an empty choice both map to 503, a service
    /// without upstream configuration to 500.
    pub fn select_server(&self, route: &RouteMatch, key: Option<&str>) -> Result<Server> {
        let upstream = self.upstream(&route.service).ok_or_else(|| {
            Error::explain(
                ErrorType::HTTPStatus(500),
                format!("no upstream configured for service {}", route.service),
            )
        })?;

        let pool = self.registry.servers(&route.service);
        match upstream.rule.choose(key, &pool) {
            Ok(Some(server)) => Ok(server),
            Ok(None) => Err(Error::explain(
                ErrorType::HTTPStatus(503),
                format!("no available server for service {}", route.service),
            )),
            Err(e @ SelectionError::UnpublishedPin { .. }) => Err(Error::explain(
                ErrorType::HTTPStatus(503),
                format!("service {}: {}", route.service, e),
            )),
        }
    }

    /// Health tracker of the request's service, unless it went to a pinned target.
    fn tracker_for(&self, ctx: &GatewayCtx) -> Option<&Arc<HealthTracker>> {
        if ctx.pinned {
            return None;
        }
        ctx.route
            .as_ref()
            .and_then(|route| self.upstreams.get(&route.service))
            .map(|upstream| &upstream.health_tracker)
    }
}

#[async_trait]
impl ProxyHttp for GatewayProxy {
    type CTX = GatewayCtx;

    fn new_ctx(&self) -> Self::CTX {
        GatewayCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        self.filters.run(session.req_header(), &mut ctx.request);
        Ok(false)
    }

    async fn upstream_peer(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let path = session.req_header().uri.path();

        let route = self.router.find_route(path).ok_or_else(|| {
            Error::explain(ErrorType::HTTPStatus(404), format!("no route for path={}", path))
        })?;

        let key = ctx.request.routing_key();
        let server = self.select_server(&route, key)?;
        let pinned = self
            .upstreams
            .get(&route.service)
            .is_some_and(|upstream| upstream.rule.is_pinned(key));

        let addr = resolve_backend(&server).await?;
        let peer = HttpPeer::new(addr, false, String::new());

        // Retries call upstream_peer again; release the previous pick first.
        if let Some(previous) = ctx.backend_address.take() {
            if let Some(tracker) = self.tracker_for(ctx) {
                tracker.end_request(&previous);
            }
        }

        let address = server.address();
        if !pinned {
            if let Some(upstream) = self.upstreams.get(&route.service) {
                upstream.health_tracker.begin_request(&address);
            }
        }
        ctx.pinned = pinned;
        ctx.backend_address = Some(address);
        ctx.route = Some(route);

        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(route) = ctx.route.as_ref() else {
            return Ok(());
        };

        let uri = build_forward_uri(&route.forward_path, upstream_request.uri.query())
            .map_err(|e| Error::explain(ErrorType::InternalError, e))?;
        upstream_request.set_uri(uri);

        if let Some(prefix) = &route.stripped_prefix {
            upstream_request.insert_header(FORWARDED_PREFIX_HEADER, prefix.as_str())?;
        }
        Ok(())
    }

    async fn connected_to_upstream(
        &self,
        _session: &mut Session,
        _reused: bool,
        _peer: &HttpPeer,
        _fd: std::os::unix::io::RawFd,
        _digest: Option<&pingora_core::protocols::Digest>,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let (Some(addr), Some(tracker)) = (ctx.backend_address.as_deref(), self.tracker_for(ctx)) {
            tracker.record_success(addr);
        }
        Ok(())
    }

    fn fail_to_connect(
        &self,
        _session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        e: Box<Error>,
    ) -> Box<Error> {
        if let (Some(addr), Some(tracker)) = (ctx.backend_address.as_deref(), self.tracker_for(ctx)) {
            tracker.record_failure(addr);
        }
        e
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);

        let method = session.req_header().method.as_str();
        let path = session.req_header().uri.path();
        let service = ctx.route.as_ref().map(|r| r.service.as_str()).unwrap_or("-");
        let routing_key = ctx.request.routing_key().unwrap_or("-");
        let backend = ctx.backend_address.as_deref().unwrap_or("-");

        match e {
            Some(err) => tracing::info!(
                method = method,
                path = path,
                status = status,
                service = service,
                routing_key = routing_key,
                backend = backend,
                pinned = ctx.pinned,
                error = %err,
                "request failed"
            ),
            None => tracing::info!(
                method = method,
                path = path,
                status = status,
                service = service,
                routing_key = routing_key,
                backend = backend,
                pinned = ctx.pinned,
                "request completed"
            ),
        }

        if let (Some(addr), Some(tracker)) = (ctx.backend_address.as_deref(), self.tracker_for(ctx)) {
            tracker.end_request(addr);
        }
        ctx.request.clear();
    }
}

/// Parses an "IP:PORT" address (e.g., "192.168.1.1:8080" or "[::1]:8080").
///
/// Host names are rejected here; `resolve_backend` looks them up.
pub fn parse_backend_address(address: &str) -> Result<SocketAddr, String> {
    address
        .parse::<SocketAddr>()
        .map_err(|e| format!("invalid backend address '{}': {}", address, e))
}

/// Resolves a server to the socket address to connect to.
///
/// IP literals are used as they are. Host names go through the system
/// resolver and an IPv4 result is preferred. Failed or slow lookups map to 500.
pub async fn resolve_backend(server: &Server) -> Result<SocketAddr> {
    if let Ok(addr) = parse_backend_address(&server.address()) {
        return Ok(addr);
    }

    let lookup = tokio::net::lookup_host((server.host(), server.port()));
    let addrs: Vec<SocketAddr> = match tokio::time::timeout(RESOLVE_TIMEOUT, lookup).await {
        Ok(Ok(addrs)) => addrs.collect(),
        Ok(Err(e)) => {
            return Err(Error::explain(
                ErrorType::InternalError,
                format!("cannot resolve backend {}: {}", server, e),
            ))
        }
        Err(_) => {
            return Err(Error::explain(
                ErrorType::InternalError,
                format!("resolving backend {} timed out", server),
            ))
        }
    };

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            Error::explain(
                ErrorType::InternalError,
                format!("backend {} resolved to no address", server),
            )
        })
}

/// Builds the URI sent upstream from the forwarded path and original query.
pub fn build_forward_uri(path: &str, query: Option<&str>) -> Result<http::Uri, String> {
    let path_and_query = match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path.to_string(),
    };
    path_and_query
        .parse::<http::Uri>()
        .map_err(|e| format!("invalid forward uri '{}': {}", path_and_query, e))
}
