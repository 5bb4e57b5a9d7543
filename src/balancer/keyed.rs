//! Routing-key override on top of a fallback rule.
//!
//! `KeyedRule` checks the routing key against a fixed table of pinned
//! bindings. A hit returns the pinned server without looking at the pool or
//! the fallback rule. A miss, or no key at all, delegates to the fallback.
//!
//! Pinned targets are published once through `PinnedServer`. A binding may be
//! created before its server is known (for example when the target binds an
//! ephemeral port at startup). Until it is published, selecting it fails with
//! `SelectionError::UnpublishedPin`; it never degrades to the fallback.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::error::{GatewayError, GatewayResult, SelectionError};

use super::{SelectionRule, Server};

/// One-time publish cell for a pinned server.
///
/// Clones share the same cell, so the component that owns the target can
/// publish through its handle while the rule reads through another.
#[derive(Clone, Default)]
pub struct PinnedServer {
    cell: Arc<OnceCell<Server>>,
}

impl PinnedServer {
    /// Creates a binding whose server is not known yet.
    pub fn unpublished() -> Self {
        Self::default()
    }

    /// Creates an already published binding.
    pub fn published(server: Server) -> Self {
        Self {
            cell: Arc::new(OnceCell::with_value(server)),
        }
    }

    /// Publishes the pinned server.
    ///
    /// Publishing the same server again is a no-op; publishing a different
    /// one fails and leaves the first in place.
    pub fn publish(&self, key: &str, server: Server) -> GatewayResult<()> {
        let current = self.cell.get_or_init(|| server.clone());
        if *current != server {
            return Err(GatewayError::PinConflict {
                key: key.to_string(),
                current: current.address(),
                requested: server.address(),
            });
        }
        tracing::info!(routing_key = key, server = %current, "pinned server published");
        Ok(())
    }

    /// Returns the published server, if any.
    pub fn get(&self) -> Option<&Server> {
        self.cell.get()
    }

    /// Returns true once a server has been published.
    pub fn is_published(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl fmt::Debug for PinnedServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.get() {
            Some(server) => write!(f, "PinnedServer({})", server),
            None => f.write_str("PinnedServer(<unpublished>)"),
        }
    }
}

/// Selection rule with routing-key overrides.
pub struct KeyedRule {
    pinned: HashMap<String, PinnedServer>,
    fallback: Arc<dyn SelectionRule>,
}

impl KeyedRule {
    /// Creates a rule without pins that delegates everything to `fallback`.
    pub fn new(fallback: Arc<dyn SelectionRule>) -> Self {
        Self {
            pinned: HashMap::new(),
            fallback,
        }
    }

    /// Binds `key` to `pin`. Bindings are fixed once the rule is shared.
    pub fn with_pin(mut self, key: impl Into<String>, pin: PinnedServer) -> Self {
        self.pinned.insert(key.into(), pin);
        self
    }

}

impl SelectionRule for KeyedRule {
    fn name(&self) -> &'static str {
        "keyed"
    }

    fn choose(&self, key: Option<&str>, pool: &[Server]) -> Result<Option<Server>, SelectionError> {
        if let Some((key, pin)) = key.and_then(|k| self.pinned.get(k).map(|pin| (k, pin))) {
            return match pin.get() {
                Some(server) => Ok(Some(server.clone())),
                None => {
                    tracing::warn!(routing_key = key, "pinned server not published");
                    Err(SelectionError::UnpublishedPin {
                        key: key.to_string(),
                    })
                }
            };
        }

        self.fallback.choose(key, pool)
    }

    fn is_pinned(&self, key: Option<&str>) -> bool {
        key.is_some_and(|k| self.pinned.contains_key(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{AvailabilityRule, HealthTracker};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fallback that records how often it was consulted.
    #[derive(Default)]
    struct CountingRule {
        calls: AtomicUsize,
    }

    impl SelectionRule for CountingRule {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn choose(&self, _key: Option<&str>, pool: &[Server]) -> Result<Option<Server>, SelectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(pool.first().cloned())
        }
    }

    fn canary() -> Server {
        Server::new("127.0.0.1", 9001)
    }

    fn pool() -> Vec<Server> {
        vec![Server::new("10.0.0.1", 8080), Server::new("10.0.0.2", 8080)]
    }

    fn keyed(pin: PinnedServer) -> (KeyedRule, Arc<CountingRule>) {
        let fallback = Arc::new(CountingRule::default());
        let rule = KeyedRule::new(fallback.clone()).with_pin("canary", pin);
        (rule, fallback)
    }

    #[test]
    fn test_pinned_key_returns_pinned_server() {
        let (rule, fallback) = keyed(PinnedServer::published(canary()));
        assert_eq!(rule.choose(Some("canary"), &pool()), Ok(Some(canary())));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pinned_key_ignores_pool_contents() {
        let (rule, _) = keyed(PinnedServer::published(canary()));
        assert_eq!(rule.choose(Some("canary"), &[]), Ok(Some(canary())));
        assert_eq!(rule.choose(Some("canary"), &[canary()]), Ok(Some(canary())));
    }

    #[test]
    fn test_pinned_key_is_idempotent() {
        let (rule, _) = keyed(PinnedServer::published(canary()));
        let pool = pool();
        let first = rule.choose(Some("canary"), &pool).unwrap();
        for _ in 0..10 {
            assert_eq!(rule.choose(Some("canary"), &pool).unwrap(), first);
        }
    }

    #[test]
    fn test_no_key_delegates_to_fallback() {
        let (rule, fallback) = keyed(PinnedServer::published(canary()));
        assert_eq!(rule.choose(None, &pool()), Ok(Some(pool()[0].clone())));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_key_delegates_to_fallback() {
        let (rule, fallback) = keyed(PinnedServer::published(canary()));
        assert_eq!(rule.choose(Some("blue"), &pool()), Ok(Some(pool()[0].clone())));
        assert_eq!(rule.choose(Some("CANARY"), &pool()), Ok(Some(pool()[0].clone())));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fallback_result_returned_unchanged() {
        let (rule, _) = keyed(PinnedServer::published(canary()));
        assert_eq!(rule.choose(None, &[]), Ok(None));
    }

    #[test]
    fn test_fallback_never_returns_pinned_server() {
        let tracker = Arc::new(HealthTracker::new(3));
        let rule = KeyedRule::new(Arc::new(AvailabilityRule::new(tracker)))
            .with_pin("canary", PinnedServer::published(canary()));
        let pool = pool();
        for _ in 0..10 {
            let chosen = rule.choose(None, &pool).unwrap().unwrap();
            assert_ne!(chosen, canary());
            assert!(pool.contains(&chosen));
        }
    }

    #[test]
    fn test_unpublished_pin_fails_loudly() {
        let (rule, fallback) = keyed(PinnedServer::unpublished());
        assert_eq!(
            rule.choose(Some("canary"), &pool()),
            Err(SelectionError::UnpublishedPin {
                key: "canary".to_string()
            })
        );
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unpublished_pin_does_not_affect_other_keys() {
        let (rule, _) = keyed(PinnedServer::unpublished());
        assert!(rule.choose(None, &pool()).unwrap().is_some());
    }

    #[test]
    fn test_publish_after_construction() {
        let pin = PinnedServer::unpublished();
        let (rule, _) = keyed(pin.clone());
        assert!(rule.choose(Some("canary"), &pool()).is_err());

        pin.publish("canary", canary()).unwrap();

        assert!(pin.is_published());
        assert_eq!(rule.choose(Some("canary"), &pool()), Ok(Some(canary())));
    }

    #[test]
    fn test_publish_same_server_twice_is_ok() {
        let pin = PinnedServer::unpublished();
        pin.publish("canary", canary()).unwrap();
        pin.publish("canary", canary()).unwrap();
        assert_eq!(pin.get(), Some(&canary()));
    }

    #[test]
    fn test_publish_conflict_keeps_first() {
        let pin = PinnedServer::published(canary());
        let err = pin
            .publish("canary", Server::new("127.0.0.1", 9002))
            .unwrap_err();
        assert!(matches!(err, GatewayError::PinConflict { .. }));
        assert_eq!(pin.get(), Some(&canary()));
    }

    #[test]
    fn test_concurrent_publish_single_winner() {
        use std::thread;

        let pin = PinnedServer::unpublished();
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let pin = pin.clone();
                thread::spawn(move || pin.publish("canary", Server::new("127.0.0.1", 9000 + i)).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert!(pin.is_published());
    }

    #[test]
    fn test_is_pinned_only_for_bound_keys() {
        let (rule, fallback) = keyed(PinnedServer::unpublished());
        assert!(rule.is_pinned(Some("canary")));
        assert!(!rule.is_pinned(Some("blue")));
        assert!(!rule.is_pinned(None));
        assert!(!fallback.is_pinned(Some("canary")));
    }

    #[test]
    fn test_several_pins() {
        let blue = Server::new("127.0.0.1", 9002);
        let rule = KeyedRule::new(Arc::new(CountingRule::default()))
            .with_pin("canary", PinnedServer::published(canary()))
            .with_pin("blue", PinnedServer::published(blue.clone()));
        assert_eq!(rule.choose(Some("canary"), &pool()), Ok(Some(canary())));
        assert_eq!(rule.choose(Some("blue"), &pool()), Ok(Some(blue)));
        assert_eq!(rule.choose(Some("green"), &pool()), Ok(Some(pool()[0].clone())));
    }

    #[test]
    fn test_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KeyedRule>();
        assert_send_sync::<PinnedServer>();
    }
}
