mod credentials;

pub use credentials::{AuthClient, TokenResponse};

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{
    Account, AccountSource, ModelQuota, ModelRateLimit, RateLimitReason, StrategyKind,
    SubscriptionInfo,
};
use crate::proxy::strategy::{build_strategy, SelectionStrategy};
use crate::proxy::upstream::CloudCodeClient;
use credentials::CachedToken;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Result of one strategy pass: either an account snapshot, or a wait hint
// when every candidate is locked out.
#[derive(Debug)]
pub struct SelectionOutcome {
    pub account: Option<Account>,
    pub wait_ms: u64,
}

struct PoolInner {
    // Insertion order is the account addition order and never changes, so
    // cursor-based strategies stay deterministic.
    accounts: Vec<Account>,
    strategy: Box<dyn SelectionStrategy>,
    strategy_label: &'static str,
}

impl PoolInner {
    fn account_mut(&mut self, email: &str) -> Option<&mut Account> {
        self.accounts.iter_mut().find(|a| a.email == email)
    }

    fn clear_expired_limits(&mut self, now_ms: i64) {
        for account in &mut self.accounts {
            account.prune_expired_limits(now_ms);
        }
    }

    fn available_for(&self, model: &str, now_ms: i64) -> Vec<&Account> {
        self.accounts
            .iter()
            .filter(|a| a.is_available_for(model, now_ms))
            .collect()
    }

    // Shortest remaining lockout among enabled, non-invalid accounts; zero as
    // soon as any of them is selectable.
    fn min_wait_time_ms(&self, model: &str, now_ms: i64) -> u64 {
        let mut any_available = false;
        let mut min_wait: Option<i64> = None;

        for account in self.accounts.iter().filter(|a| a.enabled && !a.is_invalid) {
            match account.model_rate_limits.get(model) {
                Some(limit) if limit.active_at(now_ms) => {
                    let wait = limit.reset_time - now_ms;
                    min_wait = Some(min_wait.map_or(wait, |w: i64| w.min(wait)));
                }
                _ => any_available = true,
            }
        }

        if any_available {
            0
        } else {
            min_wait.unwrap_or(0).max(0) as u64
        }
    }

    fn is_all_rate_limited(&self, model: &str, now_ms: i64) -> bool {
        let mut saw_candidate = false;
        for account in self.accounts.iter().filter(|a| a.enabled && !a.is_invalid) {
            saw_candidate = true;
            match account.model_rate_limits.get(model) {
                Some(limit) if limit.active_at(now_ms) => {}
                _ => return false,
            }
        }
        saw_candidate
    }
}

// Thread-safe façade over the account slice. Every mutation goes through
// here; critical sections are short and never perform network I/O — token
// refresh and project discovery run outside the lock and only their results
// are stored.
pub struct AccountPool {
    inner: Mutex<PoolInner>,
    token_cache: DashMap<String, CachedToken>,
    project_cache: DashMap<String, String>,
    auth: AuthClient,
    upstream: Arc<CloudCodeClient>,
}

impl AccountPool {
    pub fn new(
        accounts: Vec<Account>,
        strategy: StrategyKind,
        auth: AuthClient,
        upstream: Arc<CloudCodeClient>,
    ) -> Self {
        let strategy = build_strategy(strategy);
        let strategy_label = strategy.label();
        info!(
            "Account pool initialized: {} account(s), strategy={}",
            accounts.len(),
            strategy_label
        );
        Self {
            inner: Mutex::new(PoolInner {
                accounts,
                strategy,
                strategy_label,
            }),
            token_cache: DashMap::new(),
            project_cache: DashMap::new(),
            auth,
            upstream,
        }
    }

    pub fn strategy_label(&self) -> &'static str {
        self.inner.lock().strategy_label
    }

    pub fn get_all_accounts(&self) -> Vec<Account> {
        self.inner.lock().accounts.clone()
    }

    pub fn get_account_count(&self) -> usize {
        self.inner.lock().accounts.len()
    }

    pub fn snapshot(&self, email: &str) -> Option<Account> {
        self.inner
            .lock()
            .accounts
            .iter()
            .find(|a| a.email == email)
            .cloned()
    }

    pub fn clear_expired_limits(&self) {
        self.inner.lock().clear_expired_limits(now_ms());
    }

    pub fn get_available_accounts(&self, model: &str) -> Vec<Account> {
        let mut inner = self.inner.lock();
        let now = now_ms();
        inner.clear_expired_limits(now);
        inner
            .available_for(model, now)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn is_all_rate_limited(&self, model: &str) -> bool {
        self.inner.lock().is_all_rate_limited(model, now_ms())
    }

    pub fn get_min_wait_time_ms(&self, model: &str) -> u64 {
        self.inner.lock().min_wait_time_ms(model, now_ms())
    }

    // Optimistic reset: when the whole pool looks exhausted, drop every
    // transient lockout once and let the next attempts re-learn reality.
    pub fn reset_all_rate_limits(&self) {
        let mut inner = self.inner.lock();
        let cleared: usize = inner
            .accounts
            .iter_mut()
            .map(|a| {
                let n = a.model_rate_limits.len();
                a.model_rate_limits.clear();
                n
            })
            .sum();
        warn!("🔄 Optimistic reset: cleared {} rate-limit record(s)", cleared);
    }

    pub fn mark_rate_limited(&self, email: &str, wait_ms: u64, model: &str, reason: RateLimitReason) {
        let mut inner = self.inner.lock();
        let now = now_ms();
        if let Some(account) = inner.account_mut(email) {
            account.model_rate_limits.insert(
                model.to_string(),
                ModelRateLimit {
                    is_rate_limited: true,
                    reset_time: now + wait_ms as i64,
                    reason,
                },
            );
            warn!(
                "Account {} rate limited for {} ({:?}), reset in {}s",
                email,
                model,
                reason,
                wait_ms / 1000
            );
        }
    }

    // Terminal until operator intervention (or a later successful refresh
    // through the operator flow) clears it.
    pub fn mark_invalid(&self, email: &str, reason: &str) {
        let mut inner = self.inner.lock();
        if let Some(account) = inner.account_mut(email) {
            account.is_invalid = true;
            account.invalid_reason = Some(reason.to_string());
            warn!("[W-ACCOUNT-INVALID] account_marked_invalid: {} ({})", email, reason);
        }
    }

    pub fn notify_success(&self, email: &str, model: &str) {
        let mut inner = self.inner.lock();
        let now = now_ms();
        if let Some(account) = inner.account_mut(email) {
            account.health.consecutive_failures = 0;
            account.health.last_used = now;
            account.health.last_success_at = Some(now);
            account.model_rate_limits.remove(model);
        }
        inner.strategy.notify_success(email, model);
    }

    // Returns the new consecutive-failure count so the executor can decide
    // whether an extended cooldown is due.
    pub fn notify_failure(&self, email: &str, model: &str) -> u32 {
        let mut inner = self.inner.lock();
        let now = now_ms();
        let count = match inner.account_mut(email) {
            Some(account) => {
                account.health.consecutive_failures += 1;
                account.health.last_used = now;
                account.health.consecutive_failures
            }
            None => 0,
        };
        inner.strategy.notify_failure(email, model);
        count
    }

    pub fn notify_rate_limit(&self, email: &str, model: &str) {
        let mut inner = self.inner.lock();
        inner.strategy.notify_rate_limit(email, model);
    }

    // One atomic pass: prune expired lockouts, then let the strategy pick.
    // Atomicity here is what keeps two concurrent requests from both landing
    // on the same stale rate-limited account.
    pub fn select_account(&self, model: &str) -> SelectionOutcome {
        let mut inner = self.inner.lock();
        let now = now_ms();
        inner.clear_expired_limits(now);

        if inner.available_for(model, now).is_empty() {
            let wait_ms = inner.min_wait_time_ms(model, now);
            return SelectionOutcome {
                account: None,
                wait_ms,
            };
        }

        let selected = {
            // Split borrow: the strategy ranks the accounts it lives next to.
            let PoolInner {
                accounts, strategy, ..
            } = &mut *inner;
            let refs: Vec<&Account> = accounts
                .iter()
                .filter(|a| a.is_available_for(model, now))
                .collect();
            strategy.select(&refs, model)
        };

        match selected {
            Some(email) => {
                let account = inner.accounts.iter().find(|a| a.email == email).cloned();
                SelectionOutcome {
                    account,
                    wait_ms: 0,
                }
            }
            None => SelectionOutcome {
                account: None,
                wait_ms: 0,
            },
        }
    }

    pub fn update_subscription(&self, email: &str, tier: Option<String>, project_id: Option<String>) {
        let mut inner = self.inner.lock();
        if let Some(account) = inner.account_mut(email) {
            if let Some(project) = &project_id {
                account.project_id = Some(project.clone());
            }
            account.subscription = Some(SubscriptionInfo {
                tier,
                project_id,
                detected_at: now_ms(),
            });
        }
    }

    pub fn update_quota(&self, email: &str, models: HashMap<String, ModelQuota>) {
        let mut inner = self.inner.lock();
        if let Some(account) = inner.account_mut(email) {
            account.quota.models = models;
            account.quota.last_checked = now_ms();
        }
    }

    // Cached access token for the account, refreshed on miss/expiry. The
    // refresh itself happens outside the pool lock.
    pub async fn get_token_for_account(&self, account: &Account) -> AppResult<String> {
        match account.source {
            AccountSource::Manual => account
                .api_key
                .clone()
                .ok_or_else(|| AppError::Account(format!("{} has no api key", account.email))),
            AccountSource::Oauth => {
                if let Some(cached) = self.token_cache.get(&account.email) {
                    if cached.is_fresh(now_ms()) {
                        return Ok(cached.access_token.clone());
                    }
                }

                let refresh_token = account.refresh_token.clone().ok_or_else(|| {
                    AppError::Account(format!("{} has no refresh token", account.email))
                })?;
                let token = self.auth.refresh_access_token(&refresh_token).await?;
                debug!("Access token refreshed for {}", account.email);
                self.token_cache.insert(
                    account.email.clone(),
                    CachedToken {
                        access_token: token.access_token.clone(),
                        expires_at_ms: now_ms() + (token.expires_in as i64) * 1000,
                    },
                );
                Ok(token.access_token)
            }
        }
    }

    // Resolved companion project, discovered lazily through the upstream.
    pub async fn get_project_for_account(
        &self,
        account: &Account,
        access_token: &str,
    ) -> AppResult<String> {
        if let Some(project) = &account.project_id {
            return Ok(project.clone());
        }
        if let Some(cached) = self.project_cache.get(&account.email) {
            return Ok(cached.clone());
        }

        let response = self.upstream.load_code_assist(access_token).await?;
        let project = parse_companion_project(&response).ok_or_else(|| {
            AppError::Account(format!(
                "project discovery returned no project for {}",
                account.email
            ))
        })?;

        info!("Discovered project {} for {}", project, account.email);
        self.project_cache
            .insert(account.email.clone(), project.clone());
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.account_mut(&account.email) {
            entry.project_id = Some(project.clone());
        }
        Ok(project)
    }

    pub fn clear_token_cache(&self, email: Option<&str>) {
        match email {
            Some(email) => {
                self.token_cache.remove(email);
            }
            None => self.token_cache.clear(),
        }
    }

    pub fn clear_project_cache(&self, email: Option<&str>) {
        match email {
            Some(email) => {
                self.project_cache.remove(email);
            }
            None => self.project_cache.clear(),
        }
    }
}

pub(crate) fn parse_companion_project(response: &Value) -> Option<String> {
    match response.get("cloudaicompanionProject") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Object(map)) => map
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}
