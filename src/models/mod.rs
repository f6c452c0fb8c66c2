mod account;
mod config;

pub use account::{
    Account, AccountSource, HealthStats, ModelQuota, ModelRateLimit, QuotaData, RateLimitReason,
    SubscriptionInfo,
};
pub use config::{
    AppConfig, BackoffConfig, FallbackConfig, QuotaRefreshConfig, RetryConfig, StrategyKind,
    UpstreamConfig,
};
