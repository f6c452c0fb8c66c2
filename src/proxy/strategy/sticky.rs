use std::collections::HashMap;

use tracing::debug;

use super::{RoundRobinStrategy, SelectionStrategy};
use crate::models::Account;

// Session-affinity by model: prefer the account that most recently succeeded
// on the requested model, falling back to round-robin. Bindings are dropped
// as soon as the bound account rate-limits or fails, so a sick account never
// pins a model.
pub struct StickyStrategy {
    last_success: HashMap<String, String>, // model -> email
    inner: RoundRobinStrategy,
}

impl StickyStrategy {
    pub fn new() -> Self {
        Self {
            last_success: HashMap::new(),
            inner: RoundRobinStrategy::new(),
        }
    }

    fn unbind_if_bound(&mut self, email: &str, model: &str) {
        if self.last_success.get(model).map(|e| e.as_str()) == Some(email) {
            debug!("Sticky: unbinding {} from model {}", email, model);
            self.last_success.remove(model);
        }
    }
}

impl Default for StickyStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for StickyStrategy {
    fn label(&self) -> &'static str {
        "sticky"
    }

    fn select(&mut self, available: &[&Account], model: &str) -> Option<String> {
        if let Some(bound) = self.last_success.get(model) {
            if available.iter().any(|a| a.email == *bound) {
                return Some(bound.clone());
            }
            // Bound account no longer selectable; release and rotate.
            let stale = bound.clone();
            debug!("Sticky: bound account {} unavailable for {}, rotating", stale, model);
            self.last_success.remove(model);
        }
        self.inner.select(available, model)
    }

    fn notify_success(&mut self, email: &str, model: &str) {
        self.last_success
            .insert(model.to_string(), email.to_string());
    }

    fn notify_failure(&mut self, email: &str, model: &str) {
        self.unbind_if_bound(email, model);
    }

    fn notify_rate_limit(&mut self, email: &str, model: &str) {
        self.unbind_if_bound(email, model);
    }
}
