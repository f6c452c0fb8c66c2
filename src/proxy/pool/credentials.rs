use serde_json::Value;
use tokio::time::Duration;
use tracing::debug;

use crate::error::{AppError, AppResult};

// Refresh tokens are exchanged slightly before the advertised expiry so an
// in-flight request never rides a token that dies mid-call.
pub(crate) const TOKEN_EXPIRY_SKEW_MS: i64 = 60_000;

#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct CachedToken {
    pub access_token: String,
    pub expires_at_ms: i64,
}

impl CachedToken {
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        self.expires_at_ms - TOKEN_EXPIRY_SKEW_MS > now_ms
    }
}

// OAuth refresh-token exchange against an injectable token endpoint. Tests
// point `token_url` at a local mock.
pub struct AuthClient {
    client: reqwest::Client,
    token_url: String,
}

impl AuthClient {
    pub fn new(token_url: String) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, token_url })
    }

    pub async fn refresh_access_token(&self, refresh_token: &str) -> AppResult<TokenResponse> {
        debug!("Refreshing access token via {}", self.token_url);
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AppError::OAuth(format!(
                "token refresh failed with {}: {}",
                status, body
            )));
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| AppError::OAuth(format!("malformed token response: {}", e)))?;
        let access_token = value
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| AppError::OAuth("token response missing access_token".to_string()))?
            .to_string();
        let expires_in = value
            .get("expires_in")
            .and_then(|e| e.as_u64())
            .unwrap_or(3600);

        Ok(TokenResponse {
            access_token,
            expires_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn start_token_server(router: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        (format!("http://{}/token", addr), server)
    }

    #[test]
    fn cached_token_expires_with_skew() {
        let token = CachedToken {
            access_token: "at".to_string(),
            expires_at_ms: 100_000,
        };
        assert!(token.is_fresh(100_000 - TOKEN_EXPIRY_SKEW_MS - 1));
        assert!(!token.is_fresh(100_000 - TOKEN_EXPIRY_SKEW_MS));
        assert!(!token.is_fresh(100_000));
    }

    #[tokio::test]
    async fn refresh_parses_token_response() {
        let router = Router::new().route(
            "/token",
            post(|| async { Json(json!({"access_token": "at-1", "expires_in": 1800})) }),
        );
        let (url, server) = start_token_server(router).await;

        let auth = AuthClient::new(url).expect("auth client");
        let token = auth.refresh_access_token("rt-1").await.expect("refresh");
        server.abort();

        assert_eq!(token.access_token, "at-1");
        assert_eq!(token.expires_in, 1800);
    }

    #[tokio::test]
    async fn refresh_failure_surfaces_body_for_classification() {
        let router = Router::new().route(
            "/token",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(json!({"error": "invalid_grant"})),
                )
            }),
        );
        let (url, server) = start_token_server(router).await;

        let auth = AuthClient::new(url).expect("auth client");
        let err = auth.refresh_access_token("rt-1").await.unwrap_err();
        server.abort();

        assert!(err.to_string().contains("invalid_grant"));
    }
}
