use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// How the account's upstream credential is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountSource {
    Oauth,
    Manual,
}

// Why an (account, model) pair is currently locked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitReason {
    QuotaExhausted,
    RateLimitExceeded,
    ModelCapacityExhausted,
    ServerError,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub tier: Option<String>,
    pub project_id: Option<String>,
    pub detected_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelQuota {
    // Fraction of quota remaining in 0.0..=1.0, None when the upstream did not report one.
    pub remaining_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaData {
    #[serde(default)]
    pub models: HashMap<String, ModelQuota>,
    #[serde(default)]
    pub last_checked: i64,
}

// Transient per-(account, model) lockout. reset_time is epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRateLimit {
    pub is_rate_limited: bool,
    pub reset_time: i64,
    pub reason: RateLimitReason,
}

impl ModelRateLimit {
    pub fn active_at(&self, now_ms: i64) -> bool {
        self.is_rate_limited && self.reset_time > now_ms
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthStats {
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_used: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub source: AccountSource,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub is_invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub added_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionInfo>,
    #[serde(default)]
    pub quota: QuotaData,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_rate_limits: HashMap<String, ModelRateLimit>,
    #[serde(default)]
    pub health: HealthStats,
}

fn default_enabled() -> bool {
    true
}

impl Account {
    pub fn new_oauth(email: String, refresh_token: String) -> Self {
        Self::new(email, AccountSource::Oauth, Some(refresh_token), None)
    }

    pub fn new_manual(email: String, api_key: String) -> Self {
        Self::new(email, AccountSource::Manual, None, Some(api_key))
    }

    fn new(
        email: String,
        source: AccountSource,
        refresh_token: Option<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            email,
            source,
            enabled: true,
            is_invalid: false,
            invalid_reason: None,
            refresh_token,
            api_key,
            project_id: None,
            added_at: chrono::Utc::now().timestamp_millis(),
            subscription: None,
            quota: QuotaData::default(),
            model_rate_limits: HashMap::new(),
            health: HealthStats::default(),
        }
    }

    // Availability for one model: enabled, not invalidated, and no live lockout for that model.
    pub fn is_available_for(&self, model: &str, now_ms: i64) -> bool {
        if !self.enabled || self.is_invalid {
            return false;
        }
        match self.model_rate_limits.get(model) {
            Some(limit) => !limit.active_at(now_ms),
            None => true,
        }
    }

    pub fn remaining_fraction_for(&self, model: &str) -> Option<f64> {
        self.quota
            .models
            .get(model)
            .and_then(|q| q.remaining_fraction)
    }

    // Drop lockouts that are already in the past. Used on startup load and
    // before every selection.
    pub fn prune_expired_limits(&mut self, now_ms: i64) -> usize {
        let before = self.model_rate_limits.len();
        self.model_rate_limits.retain(|_, limit| limit.active_at(now_ms));
        before - self.model_rate_limits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new_oauth("a@test".to_string(), "rt".to_string())
    }

    #[test]
    fn fresh_account_is_available() {
        let acc = account();
        assert!(acc.is_available_for("gemini-2.5-pro", 1_000));
    }

    #[test]
    fn disabled_and_invalid_accounts_are_never_available() {
        let mut acc = account();
        acc.enabled = false;
        assert!(!acc.is_available_for("gemini-2.5-pro", 1_000));

        let mut acc = account();
        acc.is_invalid = true;
        assert!(!acc.is_available_for("gemini-2.5-pro", 1_000));
    }

    #[test]
    fn model_rate_limit_is_scoped_to_one_model() {
        let mut acc = account();
        acc.model_rate_limits.insert(
            "gemini-2.5-pro".to_string(),
            ModelRateLimit {
                is_rate_limited: true,
                reset_time: 10_000,
                reason: RateLimitReason::QuotaExhausted,
            },
        );
        assert!(!acc.is_available_for("gemini-2.5-pro", 5_000));
        assert!(acc.is_available_for("gemini-2.5-flash", 5_000));
        // Past the reset time the lockout no longer applies even before pruning.
        assert!(acc.is_available_for("gemini-2.5-pro", 10_000));
    }

    #[test]
    fn prune_expired_limits_is_idempotent() {
        let mut acc = account();
        acc.model_rate_limits.insert(
            "gemini-2.5-pro".to_string(),
            ModelRateLimit {
                is_rate_limited: true,
                reset_time: 10_000,
                reason: RateLimitReason::Unknown,
            },
        );
        assert_eq!(acc.prune_expired_limits(10_000), 1);
        assert_eq!(acc.prune_expired_limits(10_000), 0);
        assert!(acc.model_rate_limits.is_empty());
    }

    #[test]
    fn account_json_round_trips_with_defaults() {
        let json = r#"{"email":"b@test","source":"manual","api_key":"sk-1","added_at":1}"#;
        let acc: Account = serde_json::from_str(json).expect("deserialize");
        assert!(acc.enabled);
        assert!(!acc.is_invalid);
        assert_eq!(acc.source, AccountSource::Manual);
        assert!(acc.model_rate_limits.is_empty());
    }
}
