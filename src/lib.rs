//! Pingora-based reverse proxy with routing-key overrides.
//!
//! Requests flagged by a header receive a routing key in their
//! `RequestContext`. A `KeyedRule` sends keyed requests to a pinned server and
//! everything else through the service's ordinary balancing rule.

pub mod balancer;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod health;
pub mod proxy;
pub mod registry;
pub mod server;

pub use context::{RequestContext, ROUTING_KEY_ATTR};
pub use error::{GatewayError, GatewayResult, SelectionError};
pub use server::{build_server, Gateway, PinSet};
