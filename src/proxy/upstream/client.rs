use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::models::{RetryConfig, UpstreamConfig};
use crate::proxy::upstream::endpoints::{
    build_method_url, METHOD_FETCH_AVAILABLE_MODELS, METHOD_LOAD_CODE_ASSIST,
};

const USER_AGENT: &str = concat!("gantry/", env!("CARGO_PKG_VERSION"));
const MODEL_LABEL_HEADER: &str = "x-cloudcode-model";

// HTTP face of the Cloud Code upstream. Generation calls target one endpoint
// at a time (the executor owns the fallback walk); the account-management
// methods used by the refresher walk the endpoint list themselves.
pub struct CloudCodeClient {
    client: Client,
    base_urls: Vec<String>,
    request_timeout: Duration,
}

impl CloudCodeClient {
    pub fn new(upstream: &UpstreamConfig, retry: &RetryConfig) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(USER_AGENT)
            .build()?;

        if upstream.endpoints.is_empty() {
            return Err(AppError::Config(
                "upstream.endpoints must not be empty".to_string(),
            ));
        }

        Ok(Self {
            client,
            base_urls: upstream.endpoints.clone(),
            request_timeout: Duration::from_millis(retry.request_timeout_ms),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.base_urls
    }

    // One generation call against one specific endpoint. Classification of
    // the response belongs to the caller.
    pub async fn call_endpoint(
        &self,
        base_url: &str,
        method: &str,
        query: Option<&str>,
        access_token: &str,
        model: &str,
        body: &Value,
    ) -> Result<Response, reqwest::Error> {
        let url = build_method_url(base_url, method, query);
        self.client
            .post(&url)
            .timeout(self.request_timeout)
            .bearer_auth(access_token)
            .header(MODEL_LABEL_HEADER, model)
            .json(body)
            .send()
            .await
    }

    fn should_try_next_endpoint(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::NOT_FOUND
            || status.is_server_error()
    }

    async fn call_json_with_fallback(
        &self,
        method: &str,
        access_token: &str,
        body: Value,
    ) -> AppResult<Value> {
        let mut last_err: Option<String> = None;

        for (idx, base_url) in self.base_urls.iter().enumerate() {
            let url = build_method_url(base_url, method, None);
            let has_next = idx + 1 < self.base_urls.len();

            let response = self
                .client
                .post(&url)
                .timeout(self.request_timeout)
                .bearer_auth(access_token)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        if idx > 0 {
                            debug!("Upstream fallback succeeded for {} at {}", method, base_url);
                        }
                        return Ok(resp.json::<Value>().await?);
                    }
                    let text = resp.text().await.unwrap_or_default();
                    if has_next && Self::should_try_next_endpoint(status) {
                        warn!(
                            "Upstream endpoint returned {} at {} (method={}), trying next endpoint",
                            status, base_url, method
                        );
                        last_err = Some(format!("{} returned {}: {}", base_url, status, text));
                        continue;
                    }
                    return Err(AppError::Upstream(format!(
                        "{} returned {}: {}",
                        method, status, text
                    )));
                }
                Err(e) => {
                    let msg = format!("HTTP request failed at {}: {}", base_url, e);
                    debug!("{}", msg);
                    last_err = Some(msg);
                    if !has_next {
                        break;
                    }
                }
            }
        }

        Err(AppError::Upstream(
            last_err.unwrap_or_else(|| "All endpoints failed".to_string()),
        ))
    }

    // Subscription tier + companion project; doubles as a liveness probe for
    // the refresher.
    pub async fn load_code_assist(&self, access_token: &str) -> AppResult<Value> {
        self.call_json_with_fallback(
            METHOD_LOAD_CODE_ASSIST,
            access_token,
            serde_json::json!({ "metadata": { "pluginType": "GEMINI" } }),
        )
        .await
    }

    pub async fn fetch_available_models(
        &self,
        access_token: &str,
        project_id: &str,
    ) -> AppResult<Value> {
        self.call_json_with_fallback(
            METHOD_FETCH_AVAILABLE_MODELS,
            access_token,
            serde_json::json!({ "project": project_id }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn start_mock(router: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve mock");
        });
        (format!("http://{}/v1internal", addr), server)
    }

    fn client_for(endpoints: Vec<String>) -> CloudCodeClient {
        let upstream = UpstreamConfig {
            endpoints,
            ..UpstreamConfig::default()
        };
        CloudCodeClient::new(&upstream, &RetryConfig::default()).expect("client")
    }

    #[tokio::test]
    async fn load_code_assist_returns_upstream_json() {
        let router = Router::new().route(
            "/v1internal:loadCodeAssist",
            post(|| async {
                Json(json!({
                    "currentTier": { "id": "pro" },
                    "cloudaicompanionProject": "projects/demo"
                }))
            }),
        );
        let (base_url, server) = start_mock(router).await;

        let client = client_for(vec![base_url]);
        let value = client.load_code_assist("token").await.expect("call");
        server.abort();

        assert_eq!(value["cloudaicompanionProject"], "projects/demo");
    }

    #[tokio::test]
    async fn json_call_falls_back_to_next_endpoint_on_server_error() {
        let failing = Router::new().route(
            "/v1internal:loadCodeAssist",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let healthy = Router::new().route(
            "/v1internal:loadCodeAssist",
            post(|| async { Json(json!({ "ok": true })) }),
        );
        let (bad_url, bad_server) = start_mock(failing).await;
        let (good_url, good_server) = start_mock(healthy).await;

        let client = client_for(vec![bad_url, good_url]);
        let value = client.load_code_assist("token").await.expect("fallback");
        bad_server.abort();
        good_server.abort();

        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn call_endpoint_sends_bearer_and_model_label() {
        use axum::http::HeaderMap;

        let router = Router::new().route(
            "/v1internal:generateContent",
            post(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let model = headers
                    .get(MODEL_LABEL_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                Json(json!({ "auth": auth, "model": model }))
            }),
        );
        let (base_url, server) = start_mock(router).await;

        let client = client_for(vec![base_url.clone()]);
        let response = client
            .call_endpoint(
                &base_url,
                "generateContent",
                None,
                "test-token",
                "gemini-2.5-pro",
                &json!({"request": {}}),
            )
            .await
            .expect("call");
        let echoed: Value = response.json().await.expect("json");
        server.abort();

        assert_eq!(echoed["auth"], "Bearer test-token");
        assert_eq!(echoed["model"], "gemini-2.5-pro");
    }
}
