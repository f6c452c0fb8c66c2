use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::models::Account;
use crate::proxy::executor::backoff::{
    calculate_smart_backoff, matches_any_marker, parse_reset_time,
};
use crate::proxy::executor::streaming::{
    assemble_stream, collect_stream_to_json, empty_response_fallback_sequence, probe_stream,
    stream_from_events, StreamProbe,
};
use crate::proxy::executor::{AttemptError, ExecuteRequest, Execution, RequestExecutor};
use crate::proxy::upstream::decode_sse_stream;
use crate::proxy::upstream::endpoints::{
    METHOD_GENERATE_CONTENT, METHOD_STREAM_GENERATE_CONTENT, SSE_QUERY,
};

struct AttemptContext {
    access_token: String,
    body: Value,
}

impl RequestExecutor {
    async fn acquire_context(
        &self,
        account: &Account,
        model: &str,
        request: &ExecuteRequest,
    ) -> Result<AttemptContext, AttemptError> {
        let access_token = match self.pool.get_token_for_account(account).await {
            Ok(token) => token,
            Err(e) => {
                let detail = e.to_string();
                if matches_any_marker(&detail, &self.config.upstream.permanent_auth_markers) {
                    self.pool.mark_invalid(&account.email, &detail);
                    return Err(AttemptError::InvalidCredentials(detail));
                }
                return Err(AttemptError::Network(detail));
            }
        };

        let project_id = match self
            .pool
            .get_project_for_account(account, &access_token)
            .await
        {
            Ok(project) => project,
            Err(e) => return Err(AttemptError::Network(e.to_string())),
        };

        let body = self
            .payloads
            .build(&request.payload, &project_id, model)
            .map_err(AttemptError::Terminal)?;

        Ok(AttemptContext { access_token, body })
    }

    // One selected account, walked across the endpoint fallback list.
    // Everything that escapes here is already classified for the outer loop.
    pub(super) async fn attempt_account(
        &self,
        account: &Account,
        model: &str,
        request: &ExecuteRequest,
        attempt: usize,
        cancel: &CancellationToken,
        trace_id: &str,
    ) -> Result<Execution, AttemptError> {
        let mut ctx = self.acquire_context(account, model, request).await?;

        let use_stream = request.stream || self.config.upstream.is_thinking_model(model);
        let (method, query) = if use_stream {
            (METHOD_STREAM_GENERATE_CONTENT, Some(SSE_QUERY))
        } else {
            (METHOD_GENERATE_CONTENT, None)
        };

        let endpoints = self.upstream.endpoints().to_vec();
        let mut endpoint_idx = 0usize;
        let mut capacity_retries = 0usize;
        let mut last_error: Option<String> = None;
        let mut last_was_server_error = false;

        while endpoint_idx < endpoints.len() {
            if cancel.is_cancelled() {
                return Err(AttemptError::Terminal(AppError::Cancelled));
            }
            let base_url = &endpoints[endpoint_idx];

            let response = match self
                .upstream
                .call_endpoint(base_url, method, query, &ctx.access_token, model, &ctx.body)
                .await
            {
                Ok(r) => r,
                // Network failure / timeout raises straight to the outer
                // handler; cooldown bookkeeping happens there.
                Err(e) => return Err(AttemptError::Network(e.to_string())),
            };

            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                debug!(
                    "[{}] Upstream 2xx via {} (endpoint {}/{})",
                    trace_id,
                    base_url,
                    endpoint_idx + 1,
                    endpoints.len()
                );
                return if use_stream {
                    self.handle_streaming_success(
                        response, account, model, request, base_url, method, query, &ctx, cancel,
                        trace_id,
                    )
                    .await
                } else {
                    self.handle_json_success(response, account, model).await
                };
            }

            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string());
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| format!("HTTP {}", status));
            debug!(
                "[{}] Upstream {} at {}: {}",
                trace_id, status, base_url, error_text
            );

            match status {
                401 => {
                    if matches_any_marker(&error_text, &self.config.upstream.permanent_auth_markers)
                    {
                        self.pool.mark_invalid(&account.email, &error_text);
                        return Err(AttemptError::InvalidCredentials(error_text));
                    }
                    // Transient: drop both caches, reacquire, move one
                    // endpoint forward.
                    info!(
                        "[{}] Transient 401 for {}, refreshing credentials",
                        trace_id, account.email
                    );
                    self.pool.clear_token_cache(Some(&account.email));
                    self.pool.clear_project_cache(Some(&account.email));
                    ctx = self.acquire_context(account, model, request).await?;
                    last_error = Some(format!("HTTP 401: {}", error_text));
                    last_was_server_error = false;
                    endpoint_idx += 1;
                }
                429 | 503
                    if matches_any_marker(&error_text, &self.config.upstream.capacity_markers) =>
                {
                    if capacity_retries < self.config.retry.max_capacity_retries {
                        let delay_ms = self
                            .config
                            .retry
                            .capacity_backoff_tiers_ms
                            .get(capacity_retries)
                            .copied()
                            .unwrap_or(self.config.retry.capacity_retry_delay_ms);
                        capacity_retries += 1;
                        warn!(
                            "[{}] Capacity exhausted at {} (retry {}/{}), backing off {}ms on the same endpoint",
                            trace_id,
                            base_url,
                            capacity_retries,
                            self.config.retry.max_capacity_retries,
                            delay_ms
                        );
                        self.sleep_or_cancel(delay_ms, cancel)
                            .await
                            .map_err(AttemptError::Terminal)?;
                        // same endpoint, no index advance
                    } else if status == 503 {
                        // Retries spent: 503 switches account.
                        return Err(AttemptError::ServerError(error_text));
                    } else {
                        // Retries spent on a 429: treat as quota exhaustion.
                        return Err(self.rate_limit_account(
                            account,
                            model,
                            attempt,
                            retry_after.as_deref(),
                            &error_text,
                        ));
                    }
                }
                429 => {
                    return Err(self.rate_limit_account(
                        account,
                        model,
                        attempt,
                        retry_after.as_deref(),
                        &error_text,
                    ));
                }
                500..=599 => {
                    last_error = Some(format!("HTTP {}: {}", status, error_text));
                    last_was_server_error = true;
                    self.sleep_or_cancel(1_000, cancel)
                        .await
                        .map_err(AttemptError::Terminal)?;
                    endpoint_idx += 1;
                }
                _ => {
                    // 403/404 and friends: advance and remember.
                    last_error = Some(format!("HTTP {}: {}", status, error_text));
                    last_was_server_error = false;
                    endpoint_idx += 1;
                }
            }
        }

        let detail =
            last_error.unwrap_or_else(|| "all upstream endpoints failed".to_string());
        if last_was_server_error {
            Err(AttemptError::ServerError(detail))
        } else {
            Err(AttemptError::Terminal(AppError::Upstream(detail)))
        }
    }

    fn rate_limit_account(
        &self,
        account: &Account,
        model: &str,
        attempt: usize,
        retry_after: Option<&str>,
        error_text: &str,
    ) -> AttemptError {
        let reset_ms = parse_reset_time(retry_after, error_text);
        let (wait_ms, reason) =
            calculate_smart_backoff(&self.config.backoff, error_text, reset_ms, attempt);
        self.pool
            .mark_rate_limited(&account.email, wait_ms, model, reason);
        AttemptError::RateLimited { wait_ms }
    }

    async fn handle_json_success(
        &self,
        response: reqwest::Response,
        account: &Account,
        model: &str,
    ) -> Result<Execution, AttemptError> {
        let value: Value = response
            .json()
            .await
            .map_err(|e| AttemptError::Network(e.to_string()))?;
        let translated = self
            .payloads
            .translate_response(value)
            .map_err(AttemptError::Terminal)?;
        self.pool.notify_success(&account.email, model);
        Ok(Execution::Json(translated))
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_streaming_success(
        &self,
        first_response: reqwest::Response,
        account: &Account,
        model: &str,
        request: &ExecuteRequest,
        base_url: &str,
        method: &str,
        query: Option<&str>,
        ctx: &AttemptContext,
        cancel: &CancellationToken,
        trace_id: &str,
    ) -> Result<Execution, AttemptError> {
        let max_retries = self.config.retry.max_empty_response_retries;
        let mut response = first_response;

        for retry in 0..=max_retries {
            let events = decode_sse_stream(response.bytes_stream());
            match probe_stream(events).await {
                StreamProbe::Content { buffered, rest } => {
                    self.pool.notify_success(&account.email, model);
                    let stream = assemble_stream(buffered, rest, cancel.clone());
                    return if request.stream {
                        Ok(Execution::Stream(stream))
                    } else {
                        let value = collect_stream_to_json(stream, model)
                            .await
                            .map_err(AttemptError::Terminal)?;
                        Ok(Execution::Json(value))
                    };
                }
                StreamProbe::Failed(e) => {
                    return Err(AttemptError::Network(e.to_string()));
                }
                StreamProbe::Empty => {
                    if retry == max_retries {
                        break;
                    }
                    let delay_ms = 500u64 << retry;
                    warn!(
                        "[{}] Empty response stream from {} (retry {}/{}), refetching in {}ms",
                        trace_id,
                        base_url,
                        retry + 1,
                        max_retries,
                        delay_ms
                    );
                    self.sleep_or_cancel(delay_ms, cancel)
                        .await
                        .map_err(AttemptError::Terminal)?;
                    let refetched = self
                        .upstream
                        .call_endpoint(base_url, method, query, &ctx.access_token, model, &ctx.body)
                        .await
                        .map_err(|e| AttemptError::Network(e.to_string()))?;
                    if !refetched.status().is_success() {
                        let status = refetched.status();
                        let text = refetched.text().await.unwrap_or_default();
                        return Err(AttemptError::ServerError(format!(
                            "empty-response refetch got {}: {}",
                            status, text
                        )));
                    }
                    response = refetched;
                }
            }
        }

        // Every refetch came back hollow: surface a synthetic message instead
        // of an error so the client sees a well-formed reply.
        warn!(
            "[{}] Upstream produced no content after {} refetch(es), emitting fallback message",
            trace_id, max_retries
        );
        self.pool.notify_success(&account.email, model);
        let events = empty_response_fallback_sequence(model);
        if request.stream {
            Ok(Execution::Stream(stream_from_events(events)))
        } else {
            let value = collect_stream_to_json(stream_from_events(events), model)
                .await
                .map_err(AttemptError::Terminal)?;
            Ok(Execution::Json(value))
        }
    }
}
