mod least_used;
mod quota_aware;
mod round_robin;
mod sticky;

pub use least_used::LeastUsedStrategy;
pub use quota_aware::QuotaAwareStrategy;
pub use round_robin::RoundRobinStrategy;
pub use sticky::StickyStrategy;

use crate::models::{Account, StrategyKind};

// Policy for picking the account that serves the next request. Selection
// runs under the pool lock, so implementations stay synchronous and keep
// their own auxiliary state (cursor, affinity map) inline.
//
// `available` is always handed over in pool insertion order; ties break on
// that order across all variants.
pub trait SelectionStrategy: Send {
    fn label(&self) -> &'static str;

    fn select(&mut self, available: &[&Account], model: &str) -> Option<String>;

    fn notify_success(&mut self, _email: &str, _model: &str) {}
    fn notify_failure(&mut self, _email: &str, _model: &str) {}
    fn notify_rate_limit(&mut self, _email: &str, _model: &str) {}
}

pub fn build_strategy(kind: StrategyKind) -> Box<dyn SelectionStrategy> {
    match kind {
        StrategyKind::RoundRobin => Box::new(RoundRobinStrategy::new()),
        StrategyKind::Sticky => Box::new(StickyStrategy::new()),
        StrategyKind::LeastUsed => Box::new(LeastUsedStrategy::new()),
        StrategyKind::QuotaAware => Box::new(QuotaAwareStrategy::new()),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::account;
    use super::*;

    #[test]
    fn factory_labels_match_config_names() {
        assert_eq!(build_strategy(StrategyKind::RoundRobin).label(), "round_robin");
        assert_eq!(build_strategy(StrategyKind::Sticky).label(), "sticky");
        assert_eq!(build_strategy(StrategyKind::LeastUsed).label(), "least_used");
        assert_eq!(build_strategy(StrategyKind::QuotaAware).label(), "quota_aware");
    }

    #[test]
    fn single_account_pools_behave_identically_across_strategies() {
        let only = account("solo@test", 42);
        for kind in [
            StrategyKind::RoundRobin,
            StrategyKind::Sticky,
            StrategyKind::LeastUsed,
            StrategyKind::QuotaAware,
        ] {
            let mut strategy = build_strategy(kind);
            for _ in 0..3 {
                assert_eq!(
                    strategy.select(&[&only], "gemini-2.5-pro").as_deref(),
                    Some("solo@test"),
                    "strategy {} must keep yielding the only account",
                    strategy.label()
                );
            }
        }
    }

    #[test]
    fn empty_pool_selects_nothing() {
        for kind in [
            StrategyKind::RoundRobin,
            StrategyKind::Sticky,
            StrategyKind::LeastUsed,
            StrategyKind::QuotaAware,
        ] {
            let mut strategy = build_strategy(kind);
            assert!(strategy.select(&[], "gemini-2.5-pro").is_none());
        }
    }
}
