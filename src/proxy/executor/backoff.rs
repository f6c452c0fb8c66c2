use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::models::{BackoffConfig, RateLimitReason};

static RETRY_AFTER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry after\s+(?:(\d+)m\s*)?(\d+)s").expect("Invalid retry-after regex")
});

// Classify an upstream error body into a rate-limit reason. Structured
// `error.details[0].reason` wins; message text is the fallback. Minute-level
// wording is checked before quota wording so a TPM error is not mistaken for
// a daily-quota exhaustion.
pub fn classify_error_reason(body: &str) -> RateLimitReason {
    let trimmed = body.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            if let Some(reason) = json
                .pointer("/error/details/0/reason")
                .and_then(|v| v.as_str())
            {
                return match reason {
                    "QUOTA_EXHAUSTED" => RateLimitReason::QuotaExhausted,
                    "RATE_LIMIT_EXCEEDED" => RateLimitReason::RateLimitExceeded,
                    "MODEL_CAPACITY_EXHAUSTED" => RateLimitReason::ModelCapacityExhausted,
                    _ => RateLimitReason::Unknown,
                };
            }
            if let Some(message) = json.pointer("/error/message").and_then(|v| v.as_str()) {
                let lower = message.to_lowercase();
                if lower.contains("per minute") || lower.contains("rate limit") {
                    return RateLimitReason::RateLimitExceeded;
                }
            }
        }
    }

    let lower = body.to_lowercase();
    if lower.contains("per minute")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
    {
        RateLimitReason::RateLimitExceeded
    } else if lower.contains("capacity") || lower.contains("overloaded") {
        RateLimitReason::ModelCapacityExhausted
    } else if lower.contains("exhausted") || lower.contains("quota") {
        RateLimitReason::QuotaExhausted
    } else if lower.contains("internal server error") || lower.contains("backend error") {
        RateLimitReason::ServerError
    } else {
        RateLimitReason::Unknown
    }
}

pub fn matches_any_marker(body: &str, markers: &[String]) -> bool {
    let lower = body.to_lowercase();
    markers
        .iter()
        .any(|marker| lower.contains(&marker.to_lowercase()))
}

// Error-type-dependent wait, overridden by any server-supplied reset. The
// returned reason feeds `mark_rate_limited` so the lockout records why it
// exists.
pub fn calculate_smart_backoff(
    config: &BackoffConfig,
    error_text: &str,
    reset_ms_from_server: Option<u64>,
    attempt: usize,
) -> (u64, RateLimitReason) {
    let reason = classify_error_reason(error_text);

    if let Some(server_ms) = reset_ms_from_server {
        if server_ms > 0 {
            // Server always wins, floored to keep retries from hammering.
            return (server_ms.max(config.min_backoff_ms), reason);
        }
    }

    let wait_ms = match reason {
        RateLimitReason::QuotaExhausted => {
            let tiers = &config.quota_exhausted_tiers_ms;
            let index = attempt.min(tiers.len().saturating_sub(1));
            let wait = tiers.get(index).copied().unwrap_or(config.min_backoff_ms);
            debug!(
                "Quota exhausted, attempt {} -> backoff tier {}ms",
                attempt, wait
            );
            wait
        }
        RateLimitReason::RateLimitExceeded => config.rate_limit_exceeded_ms,
        RateLimitReason::ModelCapacityExhausted => config.model_capacity_ms,
        RateLimitReason::ServerError => config.server_error_ms,
        RateLimitReason::Unknown => config.min_backoff_ms,
    };

    (wait_ms.max(config.min_backoff_ms), reason)
}

// Server-declared reset in milliseconds: `Retry-After` header first (whole
// seconds), then a `retry after Nm Ns` phrase in the body.
pub fn parse_reset_time(retry_after_header: Option<&str>, body: &str) -> Option<u64> {
    if let Some(header) = retry_after_header {
        if let Ok(seconds) = header.trim().parse::<u64>() {
            return Some(seconds * 1000);
        }
    }

    let caps = RETRY_AFTER_REGEX.captures(body)?;
    let minutes = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(0);
    let seconds = caps.get(2).and_then(|m| m.as_str().parse::<u64>().ok())?;
    Some((minutes * 60 + seconds) * 1000)
}
