//! HTTP request routing and upstream dispatch.
//!
//! `Router` maps request paths to services; `GatewayProxy` plugs the filter
//! chain, the request context and the per-service selection rules into
//! Pingora's proxy phases.

mod gateway;
mod router;

pub use gateway::{
    build_forward_uri, parse_backend_address, resolve_backend, GatewayCtx, GatewayProxy, Upstream,
    FORWARDED_PREFIX_HEADER,
};
pub use router::{PathPattern, Route, RouteMatch, Router};
