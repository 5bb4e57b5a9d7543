use rand::Rng;

use crate::error::SelectionError;

use super::{total_weight, weighted_pick, SelectionRule, Server};

/// Weighted random selection over the whole pool.
#[derive(Debug, Default)]
pub struct RandomRule;

impl RandomRule {
    /// Creates the rule.
    pub fn new() -> Self {
        Self
    }
}

impl SelectionRule for RandomRule {
    fn name(&self) -> &'static str {
        "random"
    }

    fn choose(&self, _key: Option<&str>, pool: &[Server]) -> Result<Option<Server>, SelectionError> {
        if pool.len() <= 1 {
            return Ok(pool.first().cloned());
        }

        let candidates: Vec<&Server> = pool.iter().collect();
        let total = total_weight(&candidates);
        let point = rand::thread_rng().gen_range(0..total);

        Ok(weighted_pick(&candidates, point).cloned())
    }
}
