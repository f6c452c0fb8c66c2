use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{Account, ModelQuota, QuotaRefreshConfig};
use crate::modules::persistence::AccountStore;
use crate::proxy::pool::AccountPool;
use crate::proxy::upstream::CloudCodeClient;

#[derive(Debug, Default, Clone, Copy)]
pub struct RefreshStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

struct RefreshWorker {
    pool: Arc<AccountPool>,
    upstream: Arc<CloudCodeClient>,
    store: Arc<AccountStore>,
    config: QuotaRefreshConfig,
    is_refreshing: AtomicBool,
}

impl RefreshWorker {
    // One pass over the pool. Per-account failures are logged and skipped;
    // they never abort the sweep. A sweep already in flight wins.
    async fn run_sweep(&self) -> RefreshStats {
        if self.is_refreshing.swap(true, Ordering::SeqCst) {
            info!("Quota refresh already running, skipping this trigger");
            return RefreshStats::default();
        }

        let accounts = self.pool.get_all_accounts();
        let mut stats = RefreshStats::default();

        for account in &accounts {
            if !account.enabled || account.is_invalid {
                continue;
            }
            stats.total += 1;

            match self.refresh_account(account).await {
                Ok(()) => {
                    debug!("Quota refreshed for {}", account.email);
                    stats.success += 1;
                }
                Err(e) => {
                    warn!(
                        "[W-QUOTA-REFRESH] quota_refresh_failed_for_account {}: {}",
                        account.email, e
                    );
                    stats.failed += 1;
                }
            }

            // Throttle the upstream between accounts.
            tokio::time::sleep(Duration::from_millis(self.config.stagger_delay_ms)).await;
        }

        self.is_refreshing.store(false, Ordering::SeqCst);
        stats
    }

    // Token, then subscription + project (which doubles as the liveness
    // probe), then per-model quota fractions, then persist.
    async fn refresh_account(&self, account: &Account) -> AppResult<()> {
        let access_token = self.pool.get_token_for_account(account).await?;

        let assist = self.upstream.load_code_assist(&access_token).await?;
        let tier = parse_subscription_tier(&assist);
        let project = crate::proxy::pool::parse_companion_project(&assist)
            .or_else(|| account.project_id.clone());
        self.pool
            .update_subscription(&account.email, tier, project.clone());

        let project = project.ok_or_else(|| {
            AppError::Account(format!("no project resolved for {}", account.email))
        })?;
        let models_response = self
            .upstream
            .fetch_available_models(&access_token, &project)
            .await?;
        let quotas = parse_model_quotas(&models_response);
        self.pool.update_quota(&account.email, quotas);

        if let Some(snapshot) = self.pool.snapshot(&account.email) {
            self.store.save(&snapshot)?;
        }
        Ok(())
    }
}

// Background loop refreshing subscription and per-model quota fractions on a
// fixed interval. `stop` cancels the periodic trigger but lets an in-flight
// sweep drain.
pub struct QuotaRefresher {
    worker: Arc<RefreshWorker>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl QuotaRefresher {
    pub fn new(
        pool: Arc<AccountPool>,
        upstream: Arc<CloudCodeClient>,
        store: Arc<AccountStore>,
        config: QuotaRefreshConfig,
    ) -> Self {
        Self {
            worker: Arc::new(RefreshWorker {
                pool,
                upstream,
                store,
                config,
                is_refreshing: AtomicBool::new(false),
            }),
            handle: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    // Manual trigger, also used by the periodic loop.
    pub async fn refresh_all(&self) -> RefreshStats {
        self.worker.run_sweep().await
    }

    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        if !self.worker.config.enabled {
            info!("Quota refresher disabled by configuration");
            return;
        }

        let worker = self.worker.clone();
        let cancel = self.cancel.clone();
        let interval_ms = self.worker.config.interval_ms;
        *handle = Some(tokio::spawn(async move {
            info!("Quota refresh scheduler started (every {}ms)", interval_ms);
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let stats = worker.run_sweep().await;
                        info!(
                            "[Scheduler] Quota refresh completed: total={}, success={}, failed={}",
                            stats.total, stats.success, stats.failed
                        );
                    }
                }
            }
            info!("Quota refresh scheduler stopped");
        }));
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn parse_subscription_tier(assist: &Value) -> Option<String> {
    match assist.get("currentTier") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Object(map)) => map
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

fn parse_model_quotas(response: &Value) -> HashMap<String, ModelQuota> {
    let mut quotas = HashMap::new();
    let Some(models) = response.get("models").and_then(|m| m.as_array()) else {
        return quotas;
    };

    for model in models {
        let Some(name) = model.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        let info = model.get("quotaInfo").unwrap_or(model);
        let remaining_fraction = info.get("remainingFraction").and_then(|v| v.as_f64());
        let reset_time = info
            .get("resetTime")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        quotas.insert(
            name.to_string(),
            ModelQuota {
                remaining_fraction,
                reset_time,
            },
        );
    }
    quotas
}
