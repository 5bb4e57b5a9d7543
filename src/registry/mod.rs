//! Candidate server pools for the gateway's services.
//!
//! The registry is the only source of servers for fallback selection.
//! Selection rules read from it and never modify it.

mod server_registry;

pub use server_registry::ServerRegistry;
