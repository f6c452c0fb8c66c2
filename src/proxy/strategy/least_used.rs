use super::SelectionStrategy;
use crate::models::Account;

// Coldest-first: smallest `last_used` wins, insertion order breaks ties
// (min_by_key keeps the first minimum and `available` arrives in pool order).
pub struct LeastUsedStrategy;

impl LeastUsedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastUsedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for LeastUsedStrategy {
    fn label(&self) -> &'static str {
        "least_used"
    }

    fn select(&mut self, available: &[&Account], _model: &str) -> Option<String> {
        available
            .iter()
            .min_by_key(|a| a.health.last_used)
            .map(|a| a.email.clone())
    }
}
