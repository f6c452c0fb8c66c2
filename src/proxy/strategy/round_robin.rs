use super::SelectionStrategy;
use crate::models::Account;

// Default policy: a cursor cycling over whatever is available right now.
pub struct RoundRobinStrategy {
    cursor: usize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn label(&self) -> &'static str {
        "round_robin"
    }

    fn select(&mut self, available: &[&Account], _model: &str) -> Option<String> {
        if available.is_empty() {
            return None;
        }
        let picked = available[self.cursor % available.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Some(picked.email.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::account;
    use super::*;

    #[test]
    fn consecutive_selections_form_a_permutation() {
        let a = account("a@test", 0);
        let b = account("b@test", 0);
        let c = account("c@test", 0);
        let available = [&a, &b, &c];

        let mut strategy = RoundRobinStrategy::new();
        let mut seen: Vec<String> = (0..available.len())
            .map(|_| strategy.select(&available, "m").expect("selection"))
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["a@test", "b@test", "c@test"]);
    }

    #[test]
    fn cursor_survives_shrinking_availability() {
        let a = account("a@test", 0);
        let b = account("b@test", 0);
        let mut strategy = RoundRobinStrategy::new();

        assert_eq!(strategy.select(&[&a, &b], "m").as_deref(), Some("a@test"));
        // "a" drops out; the cursor keeps cycling over what remains.
        assert_eq!(strategy.select(&[&b], "m").as_deref(), Some("b@test"));
        assert_eq!(strategy.select(&[&a, &b], "m").as_deref(), Some("a@test"));
    }
}
