//! HTTP client for the tool service.
//!
//! `POST /tool/<name>` with JSON arguments; the service reports its own
//! failures as an error envelope with HTTP 200, which the executor
//! inspects. Transport failures and 5xx become `MCPToolError`-kind
//! engine errors. The tool catalog from `GET /tools` is cached briefly.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use hearth_core::tool::ToolClient;
use hearth_types::error::EngineError;
use hearth_types::tool::ToolSpec;

const SPEC_CACHE_TTL: Duration = Duration::from_secs(60);

pub struct HttpToolClient {
    client: reqwest::Client,
    base_url: String,
    specs_cache: Mutex<Option<(Vec<ToolSpec>, Instant)>>,
}

impl HttpToolClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            // The executor enforces per-tool budgets; this is only a
            // backstop against a wedged connection.
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            specs_cache: Mutex::new(None),
        }
    }
}

impl ToolClient for HttpToolClient {
    async fn call(&self, tool: &str, args: Value) -> Result<Value, EngineError> {
        let response = self
            .client
            .post(format!("{}/tool/{tool}", self.base_url))
            .json(&args)
            .send()
            .await
            .map_err(|e| EngineError::ToolService {
                kind: "internal".to_string(),
                message: format!("tool service unreachable: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::ToolService {
                kind: "internal".to_string(),
                message: format!("tool service HTTP {status}: {}", body.chars().take(200).collect::<String>()),
            });
        }

        response.json().await.map_err(|e| EngineError::ToolService {
            kind: "internal".to_string(),
            message: format!("unparseable tool response: {e}"),
        })
    }

    async fn specs(&self) -> Result<Vec<ToolSpec>, EngineError> {
        {
            let cache = self.specs_cache.lock().await;
            if let Some((specs, fetched_at)) = cache.as_ref() {
                if fetched_at.elapsed() < SPEC_CACHE_TTL {
                    debug!("tool spec cache hit");
                    return Ok(specs.clone());
                }
            }
        }

        let specs: Vec<ToolSpec> = self
            .client
            .get(format!("{}/tools", self.base_url))
            .send()
            .await
            .map_err(|e| EngineError::ToolService {
                kind: "internal".to_string(),
                message: format!("tool spec fetch failed: {e}"),
            })?
            .json()
            .await
            .map_err(|e| EngineError::ToolService {
                kind: "internal".to_string(),
                message: format!("unparseable tool specs: {e}"),
            })?;

        let mut cache = self.specs_cache.lock().await;
        *cache = Some((specs.clone(), Instant::now()));
        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_call_posts_args_and_returns_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/tool/search")
                    .json_body_partial(r#"{"query": "预算"}"#);
                then.status(200).json_body(json!({"results": [], "total": 0}));
            })
            .await;

        let client = HttpToolClient::new(server.base_url());
        let result = client.call("search", json!({"query": "预算"})).await.unwrap();
        assert_eq!(result["total"], 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_envelope_passes_through_as_value() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/tool/store");
                then.status(200)
                    .json_body(json!({"error": {"kind": "validation", "message": "user_id required"}}));
            })
            .await;

        let client = HttpToolClient::new(server.base_url());
        let result = client.call("store", json!({})).await.unwrap();
        assert_eq!(result["error"]["kind"], "validation");
    }

    #[tokio::test]
    async fn test_http_failure_is_tool_service_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/tool/aggregate");
                then.status(500).body("boom");
            })
            .await;

        let client = HttpToolClient::new(server.base_url());
        let err = client.call("aggregate", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "tool_service");
    }

    #[tokio::test]
    async fn test_specs_are_cached() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/tools");
                then.status(200).json_body(json!([{
                    "name": "store",
                    "description": "Store a memory",
                    "input_schema": {"type": "object"},
                    "x_capabilities": ["write"],
                    "x_time_budget": 2000,
                    "x_latency_hint": "fast"
                }]));
            })
            .await;

        let client = HttpToolClient::new(server.base_url());
        let first = client.specs().await.unwrap();
        let second = client.specs().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second[0].name, "store");
        mock.assert_hits_async(1).await;
    }
}
