//! Request-scoped attribute storage.
//!
//! One `RequestContext` exists per in-flight request. It travels inside the
//! proxy's per-request CTX and is handed by `&mut` to each pipeline stage, so
//! filters and the selection step share state without ambient lookups.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// Attribute under which the routing key is stored.
///
/// Shared by the filter chain (writer) and the proxy's selection step (reader).
pub const ROUTING_KEY_ATTR: &str = "loadBalancerKey";

type Value = Box<dyn Any + Send + Sync>;

/// Mutable key/value store scoped to a single request.
#[derive(Default)]
pub struct RequestContext {
    attrs: HashMap<String, Value>,
}

impl RequestContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.attrs.insert(name.into(), Box::new(value));
    }

    /// Returns the value stored under `name`.
    ///
    /// Returns `None` when nothing is stored or the stored value is not a `T`.
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.attrs.get(name).and_then(|v| v.downcast_ref::<T>())
    }

    /// Returns whether any value is stored under `name`, whatever its type.
    pub fn contains(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    /// Removes the value stored under `name`. Returns whether one was present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.attrs.remove(name).is_some()
    }

    /// Drops every attribute.
    pub fn clear(&mut self) {
        self.attrs.clear();
    }

    /// Number of stored attributes.
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Returns true if no attribute is stored.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Returns the routing key, if a filter set one.
    pub fn routing_key(&self) -> Option<&str> {
        self.get::<String>(ROUTING_KEY_ATTR).map(String::as_str)
    }

    /// Sets the routing key, replacing one set earlier in the chain.
    pub fn set_routing_key(&mut self, key: impl Into<String>) {
        self.set(ROUTING_KEY_ATTR, key.into());
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.attrs.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("RequestContext")
            .field("attrs", &names)
            .field("routing_key", &self.routing_key())
            .finish()
    }
}
