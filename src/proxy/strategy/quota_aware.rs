use super::{LeastUsedStrategy, SelectionStrategy};
use crate::models::Account;

// An unreported fraction ranks between a drained account and a fresh one.
const UNKNOWN_FRACTION: f64 = 0.5;

// Richest-first: highest remaining quota fraction for the requested model.
// When no candidate reports a fraction at all there is nothing to rank on
// and selection degrades to least-used.
pub struct QuotaAwareStrategy {
    fallback: LeastUsedStrategy,
}

impl QuotaAwareStrategy {
    pub fn new() -> Self {
        Self {
            fallback: LeastUsedStrategy::new(),
        }
    }
}

impl Default for QuotaAwareStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for QuotaAwareStrategy {
    fn label(&self) -> &'static str {
        "quota_aware"
    }

    fn select(&mut self, available: &[&Account], model: &str) -> Option<String> {
        if available.is_empty() {
            return None;
        }
        if available
            .iter()
            .all(|a| a.remaining_fraction_for(model).is_none())
        {
            return self.fallback.select(available, model);
        }

        let mut best: Option<(&Account, f64)> = None;
        for candidate in available {
            let fraction = candidate
                .remaining_fraction_for(model)
                .unwrap_or(UNKNOWN_FRACTION);
            match best {
                // Strict > keeps the earliest (insertion-order) account on ties.
                Some((_, best_fraction)) if fraction <= best_fraction => {}
                _ => best = Some((candidate, fraction)),
            }
        }
        best.map(|(a, _)| a.email.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{account, with_fraction};
    use super::*;

    const MODEL: &str = "gemini-2.5-pro";

    #[test]
    fn highest_remaining_fraction_wins() {
        let a = with_fraction(account("a@test", 0), MODEL, Some(0.2));
        let b = with_fraction(account("b@test", 0), MODEL, Some(0.9));
        let c = with_fraction(account("c@test", 0), MODEL, Some(0.4));
        let mut strategy = QuotaAwareStrategy::new();
        assert_eq!(strategy.select(&[&a, &b, &c], MODEL).as_deref(), Some("b@test"));
    }

    #[test]
    fn unknown_fraction_ranks_as_medium() {
        let drained = with_fraction(account("drained@test", 0), MODEL, Some(0.1));
        let unknown = account("unknown@test", 0);
        let mut strategy = QuotaAwareStrategy::new();
        // 0.5 (unknown) beats 0.1 (known, drained).
        assert_eq!(
            strategy.select(&[&drained, &unknown], MODEL).as_deref(),
            Some("unknown@test")
        );

        let fresh = with_fraction(account("fresh@test", 0), MODEL, Some(0.8));
        assert_eq!(
            strategy.select(&[&unknown, &fresh], MODEL).as_deref(),
            Some("fresh@test")
        );
    }

    #[test]
    fn all_unknown_falls_back_to_least_used() {
        let warm = account("warm@test", 500);
        let cold = account("cold@test", 10);
        let mut strategy = QuotaAwareStrategy::new();
        assert_eq!(
            strategy.select(&[&warm, &cold], MODEL).as_deref(),
            Some("cold@test")
        );
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let a = with_fraction(account("a@test", 0), MODEL, Some(0.6));
        let b = with_fraction(account("b@test", 0), MODEL, Some(0.6));
        let mut strategy = QuotaAwareStrategy::new();
        assert_eq!(strategy.select(&[&a, &b], MODEL).as_deref(), Some("a@test"));
    }
}
