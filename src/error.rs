use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Account error: {0}")]
    Account(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error(
        "RESOURCE_EXHAUSTED: Rate limited on {model}. Quota will reset after {reset_after}. Next available: {next_available}"
    )]
    ResourceExhausted {
        model: String,
        reset_after: String,
        next_available: String,
    },

    #[error("AUTH_INVALID_PERMANENT: {0}")]
    AuthInvalidPermanent(String),

    #[error("Max retries exceeded")]
    MaxRetriesExceeded,

    #[error("No accounts available for {0}")]
    NoAccountsAvailable(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Unknown error: {0}")]
    Unknown(String),
}
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}
pub type AppResult<T> = Result<T, AppError>;

// Wait durations embedded in user-visible errors ("30s", "5m30s", "2h5m").
pub fn format_wait(ms: u64) -> String {
    let total_secs = ms.div_ceil(1000);
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{}h{}m", hours, minutes)
    } else if minutes > 0 && seconds > 0 {
        format!("{}m{}s", minutes, seconds)
    } else if minutes > 0 {
        format!("{}m", minutes)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_exhausted_message_carries_model_and_reset() {
        let err = AppError::ResourceExhausted {
            model: "gemini-2.5-pro".to_string(),
            reset_after: format_wait(90_000),
            next_available: "2026-08-02T12:00:00+00:00".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("RESOURCE_EXHAUSTED: Rate limited on gemini-2.5-pro"));
        assert!(msg.contains("after 1m30s"));
        assert!(msg.contains("Next available: 2026-08-02T12:00:00+00:00"));
    }

    #[test]
    fn format_wait_rounds_up_to_whole_seconds() {
        assert_eq!(format_wait(1), "1s");
        assert_eq!(format_wait(30_000), "30s");
        assert_eq!(format_wait(60_000), "1m");
        assert_eq!(format_wait(330_000), "5m30s");
        assert_eq!(format_wait(7_500_000), "2h5m");
    }
}
