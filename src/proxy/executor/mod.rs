pub mod backoff;
pub mod streaming;

mod attempt;

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::SecondsFormat;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{format_wait, AppError, AppResult};
use crate::models::{Account, AppConfig, RateLimitReason};
use crate::proxy::payload::PayloadBuilder;
use crate::proxy::pool::AccountPool;
use crate::proxy::upstream::CloudCodeClient;
use streaming::EventStream;

// One logical Messages call, already translated by the hosting layer as far
// as the core cares: target model, stream flag, opaque request payload.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub model: String,
    pub stream: bool,
    pub payload: Value,
}

// What a call resolves to: a JSON reply, or a lazy finite event sequence.
pub enum Execution {
    Json(Value),
    Stream(EventStream),
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Execution::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Execution::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

// Attempt-scope classification; the outer loop makes exactly one
// switch/wait/fail decision per variant.
pub(crate) enum AttemptError {
    RateLimited { wait_ms: u64 },
    InvalidCredentials(String),
    ServerError(String),
    Network(String),
    Terminal(AppError),
}

struct Inflight {
    count: AtomicUsize,
    notify: Notify,
}

struct InflightGuard {
    inflight: Arc<Inflight>,
}

impl InflightGuard {
    fn new(inflight: Arc<Inflight>) -> Self {
        inflight.count.fetch_add(1, Ordering::SeqCst);
        Self { inflight }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.count.fetch_sub(1, Ordering::SeqCst);
        self.inflight.notify.notify_waiters();
    }
}

// The retry/failover state machine wrapping one logical Messages call.
// Shared by all in-flight requests; owns no account state of its own.
pub struct RequestExecutor {
    pool: Arc<AccountPool>,
    upstream: Arc<CloudCodeClient>,
    payloads: Arc<dyn PayloadBuilder>,
    config: Arc<AppConfig>,
    inflight: Arc<Inflight>,
}

fn generate_trace_id() -> String {
    rand::Rng::sample_iter(rand::thread_rng(), &rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

impl RequestExecutor {
    pub fn new(
        pool: Arc<AccountPool>,
        upstream: Arc<CloudCodeClient>,
        payloads: Arc<dyn PayloadBuilder>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            pool,
            upstream,
            payloads,
            config,
            inflight: Arc::new(Inflight {
                count: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    // A call is bounded by max(MAX_RETRIES, accountCount + 1) attempts; every
    // attempt is an independent selection.
    fn max_attempts(&self) -> usize {
        self.config
            .retry
            .max_retries
            .max(self.pool.get_account_count() + 1)
    }

    pub async fn execute(
        &self,
        request: ExecuteRequest,
        fallback_enabled: bool,
        cancel: CancellationToken,
    ) -> AppResult<Execution> {
        let guard = InflightGuard::new(self.inflight.clone());
        let trace_id = generate_trace_id();
        info!(
            "[{}] Messages call | model: {} | stream: {} | strategy: {}",
            trace_id,
            request.model,
            request.stream,
            self.pool.strategy_label()
        );

        let model = request.model.clone();
        let mut visited = HashSet::new();
        let result = if request.stream {
            self.execute_model(&request, &model, fallback_enabled, &mut visited, &cancel, &trace_id)
                .await
        } else {
            // Non-streaming calls additionally cap at a hard upper limit.
            let cap = Duration::from_millis(self.config.retry.non_streaming_cap_ms);
            match tokio::time::timeout(
                cap,
                self.execute_model(
                    &request,
                    &model,
                    fallback_enabled,
                    &mut visited,
                    &cancel,
                    &trace_id,
                ),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AppError::Upstream(format!(
                    "non-streaming request exceeded {}ms",
                    self.config.retry.non_streaming_cap_ms
                ))),
            }
        };

        match result {
            Ok(Execution::Stream(stream)) => {
                // The guard rides the stream so drain waits for the last event.
                let stream: EventStream = Box::pin(stream.map(move |item| {
                    let _ = &guard;
                    item
                }));
                Ok(Execution::Stream(stream))
            }
            other => other,
        }
    }

    fn execute_model<'a>(
        &'a self,
        request: &'a ExecuteRequest,
        model: &'a str,
        fallback_enabled: bool,
        visited: &'a mut HashSet<String>,
        cancel: &'a CancellationToken,
        trace_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = AppResult<Execution>> + Send + 'a>> {
        Box::pin(async move {
            visited.insert(model.to_string());

            // Optimistic reset: a fully rate-limited pool may be stale; clear
            // once and re-learn from live responses.
            if self.pool.is_all_rate_limited(model) {
                self.pool.reset_all_rate_limits();
            }

            let max_attempts = self.max_attempts();
            let mut attempt = 0usize;

            while attempt < max_attempts {
                if cancel.is_cancelled() {
                    return Err(AppError::Cancelled);
                }

                let available = self.pool.get_available_accounts(model);
                if available.is_empty() {
                    if self.pool.is_all_rate_limited(model) {
                        let min_wait = self.pool.get_min_wait_time_ms(model);
                        if min_wait > self.config.retry.max_wait_before_error_ms {
                            if let Some(next) = self.fallback_target(model, fallback_enabled, visited)
                            {
                                info!(
                                    "[{}] Pool exhausted for {} ({}ms wait), falling back to {}",
                                    trace_id, model, min_wait, next
                                );
                                return self
                                    .execute_model(
                                        request,
                                        &next,
                                        fallback_enabled,
                                        visited,
                                        cancel,
                                        trace_id,
                                    )
                                    .await;
                            }
                            return Err(resource_exhausted(model, min_wait));
                        }
                        info!(
                            "[{}] All accounts rate limited for {}, waiting {}ms",
                            trace_id,
                            model,
                            min_wait + 500
                        );
                        // Short wait does not consume an attempt.
                        self.sleep_or_cancel(min_wait + 500, cancel).await?;
                        continue;
                    }
                    return Err(AppError::NoAccountsAvailable(model.to_string()));
                }

                let selection = self.pool.select_account(model);
                let Some(account) = selection.account else {
                    if selection.wait_ms > 0 {
                        self.sleep_or_cancel(selection.wait_ms, cancel).await?;
                    } else {
                        // Strategy yielded nothing despite availability; pace
                        // the loop instead of spinning.
                        self.sleep_or_cancel(1_000, cancel).await?;
                    }
                    attempt += 1;
                    continue;
                };

                info!(
                    "[{}] ✓ Using account {} for {} (attempt {}/{})",
                    trace_id,
                    account.email,
                    model,
                    attempt + 1,
                    max_attempts
                );

                let outcome = self
                    .attempt_account(&account, model, request, attempt, cancel, trace_id)
                    .await;
                attempt += 1;

                match outcome {
                    Ok(execution) => return Ok(execution),
                    Err(AttemptError::RateLimited { wait_ms }) => {
                        debug!(
                            "[{}] {} rate limited for {}ms, switching account",
                            trace_id, account.email, wait_ms
                        );
                        self.pool.notify_rate_limit(&account.email, model);
                    }
                    Err(AttemptError::InvalidCredentials(detail)) => {
                        warn!(
                            "[{}] {} has invalid credentials, switching account: {}",
                            trace_id, account.email, detail
                        );
                    }
                    Err(AttemptError::ServerError(detail)) => {
                        debug!("[{}] Server error on {}: {}", trace_id, account.email, detail);
                        self.register_failure(&account, model, trace_id);
                    }
                    Err(AttemptError::Network(detail)) => {
                        debug!("[{}] Network error on {}: {}", trace_id, account.email, detail);
                        self.register_failure(&account, model, trace_id);
                        self.sleep_or_cancel(1_000, cancel).await?;
                    }
                    Err(AttemptError::Terminal(e)) => return Err(e),
                }
            }

            if let Some(next) = self.fallback_target(model, fallback_enabled, visited) {
                info!(
                    "[{}] Attempts exhausted for {}, falling back to {}",
                    trace_id, model, next
                );
                return self
                    .execute_model(request, &next, fallback_enabled, visited, cancel, trace_id)
                    .await;
            }
            Err(AppError::MaxRetriesExceeded)
        })
    }

    fn fallback_target(
        &self,
        model: &str,
        fallback_enabled: bool,
        visited: &HashSet<String>,
    ) -> Option<String> {
        if !fallback_enabled || !self.config.fallback.enabled {
            return None;
        }
        let next = self.config.fallback.fallback_model(model)?;
        // Revisit guard keeps a cyclic user-configured chain finite.
        if visited.contains(next) {
            return None;
        }
        Some(next.to_string())
    }

    fn register_failure(&self, account: &Account, model: &str, trace_id: &str) {
        let failures = self.pool.notify_failure(&account.email, model);
        if failures >= self.config.retry.max_consecutive_failures {
            warn!(
                "[{}] {} failed {} times in a row, applying extended cooldown ({}ms)",
                trace_id, account.email, failures, self.config.retry.extended_cooldown_ms
            );
            self.pool.mark_rate_limited(
                &account.email,
                self.config.retry.extended_cooldown_ms,
                model,
                RateLimitReason::ServerError,
            );
        }
    }

    pub(super) async fn sleep_or_cancel(
        &self,
        ms: u64,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.count.load(Ordering::SeqCst)
    }

    // Let in-flight calls (including returned streams) drain, bounded by the
    // caller's timeout. Returns whether the executor is idle.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.inflight.count.load(Ordering::SeqCst) > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = tokio::time::timeout(deadline - now, self.inflight.notify.notified()).await;
        }
        true
    }
}

fn resource_exhausted(model: &str, wait_ms: u64) -> AppError {
    let next_available = chrono::Utc::now() + chrono::Duration::milliseconds(wait_ms as i64);
    AppError::ResourceExhausted {
        model: model.to_string(),
        reset_after: format_wait(wait_ms),
        next_available: next_available.to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppConfig, StrategyKind};
    use crate::proxy::payload::CloudCodePayloadBuilder;
    use crate::proxy::pool::AuthClient;

    fn executor_with_chain(chain: &[(&str, &str)], enabled: bool) -> RequestExecutor {
        let mut config = AppConfig::new();
        config.fallback.enabled = enabled;
        config.fallback.chain = chain
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        let upstream = Arc::new(
            CloudCodeClient::new(&config.upstream, &config.retry).expect("client"),
        );
        let pool = Arc::new(AccountPool::new(
            Vec::new(),
            StrategyKind::RoundRobin,
            AuthClient::new("http://127.0.0.1:1/token".to_string()).expect("auth"),
            upstream.clone(),
        ));
        RequestExecutor::new(
            pool,
            upstream,
            Arc::new(CloudCodePayloadBuilder),
            Arc::new(config),
        )
    }

    #[test]
    fn fallback_target_follows_the_chain_once() {
        let executor = executor_with_chain(&[("lite", "flash"), ("flash", "pro")], true);
        let mut visited = HashSet::new();
        visited.insert("lite".to_string());

        assert_eq!(
            executor.fallback_target("lite", true, &visited),
            Some("flash".to_string())
        );
        assert_eq!(executor.fallback_target("pro", true, &visited), None);
    }

    #[test]
    fn fallback_is_suppressed_by_either_switch() {
        let executor = executor_with_chain(&[("lite", "flash")], true);
        let visited = HashSet::new();
        assert_eq!(executor.fallback_target("lite", false, &visited), None);

        let executor = executor_with_chain(&[("lite", "flash")], false);
        assert_eq!(executor.fallback_target("lite", true, &visited), None);
    }

    #[test]
    fn cyclic_chains_terminate_via_the_revisit_guard() {
        let executor = executor_with_chain(&[("a", "b"), ("b", "a")], true);
        let mut visited = HashSet::new();
        visited.insert("a".to_string());

        assert_eq!(
            executor.fallback_target("a", true, &visited),
            Some("b".to_string())
        );
        visited.insert("b".to_string());
        assert_eq!(executor.fallback_target("b", true, &visited), None);
    }

    #[test]
    fn max_attempts_scales_with_pool_size() {
        let executor = executor_with_chain(&[], true);
        // Empty pool: max(3, 0 + 1) = 3.
        assert_eq!(executor.max_attempts(), 3);
    }

    #[test]
    fn resource_exhausted_error_names_the_model() {
        let err = resource_exhausted("gemini-2.5-pro", 30_000);
        let msg = err.to_string();
        assert!(msg.contains("RESOURCE_EXHAUSTED: Rate limited on gemini-2.5-pro"));
        assert!(msg.contains("30s"));
    }

    #[tokio::test]
    async fn inflight_guard_tracks_drain() {
        let executor = Arc::new(executor_with_chain(&[], true));
        assert_eq!(executor.inflight_count(), 0);
        assert!(executor.wait_for_drain(Duration::from_millis(10)).await);

        let guard = InflightGuard::new(executor.inflight.clone());
        assert_eq!(executor.inflight_count(), 1);
        assert!(!executor.wait_for_drain(Duration::from_millis(20)).await);

        drop(guard);
        assert!(executor.wait_for_drain(Duration::from_millis(20)).await);
    }

    #[test]
    fn trace_ids_are_short_and_lowercase() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 6);
        assert_eq!(id, id.to_lowercase());
    }
}
