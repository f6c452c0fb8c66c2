use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub quota_refresh: QuotaRefreshConfig,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    Sticky,
    LeastUsed,
    QuotaAware,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_max_empty_response_retries")]
    pub max_empty_response_retries: usize,
    // Above this the executor stops waiting for a reset and falls back (or errors).
    #[serde(default = "default_max_wait_before_error_ms")]
    pub max_wait_before_error_ms: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_extended_cooldown_ms")]
    pub extended_cooldown_ms: u64,
    #[serde(default = "default_max_capacity_retries")]
    pub max_capacity_retries: usize,
    #[serde(default = "default_capacity_retry_delay_ms")]
    pub capacity_retry_delay_ms: u64,
    #[serde(default = "default_capacity_backoff_tiers_ms")]
    pub capacity_backoff_tiers_ms: Vec<u64>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_non_streaming_cap_ms")]
    pub non_streaming_cap_ms: u64,
}

fn default_max_retries() -> usize {
    3
}
fn default_max_empty_response_retries() -> usize {
    2
}
fn default_max_wait_before_error_ms() -> u64 {
    120_000
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_extended_cooldown_ms() -> u64 {
    300_000
}
fn default_max_capacity_retries() -> usize {
    3
}
fn default_capacity_retry_delay_ms() -> u64 {
    5_000
}
fn default_capacity_backoff_tiers_ms() -> Vec<u64> {
    vec![1_000, 5_000, 15_000]
}
fn default_request_timeout_ms() -> u64 {
    600_000
}
fn default_non_streaming_cap_ms() -> u64 {
    300_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_empty_response_retries: default_max_empty_response_retries(),
            max_wait_before_error_ms: default_max_wait_before_error_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            extended_cooldown_ms: default_extended_cooldown_ms(),
            max_capacity_retries: default_max_capacity_retries(),
            capacity_retry_delay_ms: default_capacity_retry_delay_ms(),
            capacity_backoff_tiers_ms: default_capacity_backoff_tiers_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            non_streaming_cap_ms: default_non_streaming_cap_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    // Ladder for quota exhaustion, indexed by attempt: 1m, 5m, 30m, 2h.
    #[serde(default = "default_quota_exhausted_tiers_ms")]
    pub quota_exhausted_tiers_ms: Vec<u64>,
    #[serde(default = "default_rate_limit_exceeded_ms")]
    pub rate_limit_exceeded_ms: u64,
    #[serde(default = "default_model_capacity_ms")]
    pub model_capacity_ms: u64,
    #[serde(default = "default_server_error_ms")]
    pub server_error_ms: u64,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
}

fn default_quota_exhausted_tiers_ms() -> Vec<u64> {
    vec![60_000, 300_000, 1_800_000, 7_200_000]
}
fn default_rate_limit_exceeded_ms() -> u64 {
    5_000
}
fn default_model_capacity_ms() -> u64 {
    15_000
}
fn default_server_error_ms() -> u64 {
    8_000
}
fn default_min_backoff_ms() -> u64 {
    2_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            quota_exhausted_tiers_ms: default_quota_exhausted_tiers_ms(),
            rate_limit_exceeded_ms: default_rate_limit_exceeded_ms(),
            model_capacity_ms: default_model_capacity_ms(),
            server_error_ms: default_server_error_ms(),
            min_backoff_ms: default_min_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRefreshConfig {
    #[serde(default = "default_refresh_enabled")]
    pub enabled: bool,
    #[serde(default = "default_refresh_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_stagger_delay_ms")]
    pub stagger_delay_ms: u64,
}

fn default_refresh_enabled() -> bool {
    true
}
fn default_refresh_interval_ms() -> u64 {
    900_000
}
fn default_stagger_delay_ms() -> u64 {
    2_000
}

impl Default for QuotaRefreshConfig {
    fn default() -> Self {
        Self {
            enabled: default_refresh_enabled(),
            interval_ms: default_refresh_interval_ms(),
            stagger_delay_ms: default_stagger_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_enabled")]
    pub enabled: bool,
    // model -> cheaper model substituted once the requested one is exhausted
    #[serde(default = "default_fallback_chain")]
    pub chain: HashMap<String, String>,
}

fn default_fallback_enabled() -> bool {
    true
}
fn default_fallback_chain() -> HashMap<String, String> {
    HashMap::from([
        (
            "gemini-2.5-flash-lite".to_string(),
            "gemini-2.5-flash".to_string(),
        ),
        (
            "gemini-2.5-flash".to_string(),
            "gemini-2.5-pro".to_string(),
        ),
    ])
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: default_fallback_enabled(),
            chain: default_fallback_chain(),
        }
    }
}

impl FallbackConfig {
    pub fn fallback_model(&self, model: &str) -> Option<&str> {
        self.chain.get(model).map(|m| m.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    // Ordered endpoint fallback list; all hosts carry the same semantics.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_oauth_token_url")]
    pub oauth_token_url: String,
    #[serde(default = "default_permanent_auth_markers")]
    pub permanent_auth_markers: Vec<String>,
    #[serde(default = "default_capacity_markers")]
    pub capacity_markers: Vec<String>,
    // Models routed through streamGenerateContent even for non-streaming clients.
    #[serde(default = "default_thinking_model_markers")]
    pub thinking_model_markers: Vec<String>,
}

fn default_endpoints() -> Vec<String> {
    vec![
        "https://cloudcode-pa.googleapis.com/v1internal".to_string(),
        "https://daily-cloudcode-pa.googleapis.com/v1internal".to_string(),
    ]
}
fn default_oauth_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}
fn default_permanent_auth_markers() -> Vec<String> {
    vec![
        "invalid_grant".to_string(),
        "account_disabled".to_string(),
        "API key not valid".to_string(),
        "PERMISSION_DENIED_PERMANENT".to_string(),
    ]
}
fn default_capacity_markers() -> Vec<String> {
    vec![
        "MODEL_CAPACITY_EXHAUSTED".to_string(),
        "model is overloaded".to_string(),
        "capacity exhausted".to_string(),
    ]
}
fn default_thinking_model_markers() -> Vec<String> {
    vec!["-thinking".to_string()]
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            oauth_token_url: default_oauth_token_url(),
            permanent_auth_markers: default_permanent_auth_markers(),
            capacity_markers: default_capacity_markers(),
            thinking_model_markers: default_thinking_model_markers(),
        }
    }
}

impl UpstreamConfig {
    pub fn is_thinking_model(&self, model: &str) -> bool {
        self.thinking_model_markers
            .iter()
            .any(|marker| model.contains(marker.as_str()))
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::default(),
            backoff: BackoffConfig::default(),
            quota_refresh: QuotaRefreshConfig::default(),
            strategy: StrategyKind::default(),
            fallback: FallbackConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_full_defaults() {
        let config: AppConfig = serde_json::from_str("{}").expect("parse empty config");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.capacity_backoff_tiers_ms, vec![1_000, 5_000, 15_000]);
        assert_eq!(config.backoff.quota_exhausted_tiers_ms[0], 60_000);
        assert_eq!(config.strategy, StrategyKind::RoundRobin);
        assert_eq!(config.quota_refresh.interval_ms, 900_000);
        assert_eq!(config.upstream.endpoints.len(), 2);
    }

    #[test]
    fn strategy_names_parse_from_snake_case() {
        let config: AppConfig =
            serde_json::from_str(r#"{"strategy":"quota_aware"}"#).expect("parse");
        assert_eq!(config.strategy, StrategyKind::QuotaAware);
    }

    #[test]
    fn default_fallback_chain_ends_at_pro() {
        let fallback = FallbackConfig::default();
        assert_eq!(
            fallback.fallback_model("gemini-2.5-flash-lite"),
            Some("gemini-2.5-flash")
        );
        assert_eq!(
            fallback.fallback_model("gemini-2.5-flash"),
            Some("gemini-2.5-pro")
        );
        assert_eq!(fallback.fallback_model("gemini-2.5-pro"), None);
    }

    #[test]
    fn thinking_models_are_detected_by_marker() {
        let upstream = UpstreamConfig::default();
        assert!(upstream.is_thinking_model("gemini-2.5-pro-thinking"));
        assert!(!upstream.is_thinking_model("gemini-2.5-pro"));
    }
}
