//! OpenAI-compatible chat/embedding client.
//!
//! One client covers any provider speaking the `chat/completions` +
//! `embeddings` dialect (OpenAI, Qwen, Moonshot, DeepSeek, ...) via a
//! configurable base URL. Requests pass through a per-provider rate
//! limiter; identical requests within a short window are served from the
//! response cache; token usage is accumulated for cost logging.
//!
//! The API key lives in a [`SecretString`] and never reaches Debug output
//! or logs.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use hearth_core::llm::cache::ResponseCache;
use hearth_core::llm::rate_limit::RateLimiter;
use hearth_core::llm::{ChatOptions, LlmClient, extract_json};
use hearth_types::error::EngineError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Accumulated token usage across the process lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageTotals {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

pub struct OpenAiCompatClient {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    embedding_model: String,
    limiter: RateLimiter,
    cache: ResponseCache,
    usage: Mutex<UsageTotals>,
}

impl OpenAiCompatClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api_key: SecretString,
        base_url: Option<String>,
        model: String,
        embedding_model: String,
        rpm_limit: u32,
        concurrency: u32,
        cache_ttl: Duration,
        cache_max_items: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model,
            embedding_model,
            limiter: RateLimiter::new(rpm_limit, concurrency),
            cache: ResponseCache::new(cache_ttl, cache_max_items),
            usage: Mutex::new(UsageTotals::default()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn usage(&self) -> UsageTotals {
        *self.usage.lock().await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn chat(
        &self,
        system: &str,
        user: &str,
        opts: ChatOptions,
        json_mode: bool,
    ) -> Result<String, EngineError> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let _permit = self.limiter.acquire().await;
        let response = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(EngineError::Llm {
                message: format!("HTTP {status}: {}", error_body.chars().take(200).collect::<String>()),
                retryable: status.as_u16() == 429 || status.is_server_error(),
            });
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| EngineError::Llm {
            message: format!("unparseable completion response: {e}"),
            retryable: false,
        })?;

        if let Some(usage) = &parsed.usage {
            let mut totals = self.usage.lock().await;
            totals.requests += 1;
            totals.prompt_tokens += usage.prompt_tokens.unwrap_or(0);
            totals.completion_tokens += usage.completion_tokens.unwrap_or(0);
            debug!(
                prompt_tokens = usage.prompt_tokens.unwrap_or(0),
                completion_tokens = usage.completion_tokens.unwrap_or(0),
                "llm usage recorded"
            );
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EngineError::Llm {
                message: "completion response carried no content".to_string(),
                retryable: false,
            })
    }
}

impl LlmClient for OpenAiCompatClient {
    async fn chat_text(
        &self,
        system: &str,
        user: &str,
        opts: ChatOptions,
    ) -> Result<String, EngineError> {
        let key = ResponseCache::key("text", system, user, opts.temperature, opts.max_tokens);
        if let Some(Value::String(cached)) = self.cache.get(&key).await {
            debug!("llm cache hit (text)");
            return Ok(cached);
        }

        let content = self.chat(system, user, opts, false).await?;
        self.cache.put(key, Value::String(content.clone())).await;
        Ok(content)
    }

    async fn chat_json(
        &self,
        system: &str,
        user: &str,
        opts: ChatOptions,
    ) -> Result<Value, EngineError> {
        let key = ResponseCache::key("json", system, user, opts.temperature, opts.max_tokens);
        if let Some(cached) = self.cache.get(&key).await {
            debug!("llm cache hit (json)");
            return Ok(cached);
        }

        let content = self.chat(system, user, opts, true).await?;
        let value = extract_json(&content).ok_or_else(|| {
            warn!("model output was not JSON");
            EngineError::Llm {
                message: format!(
                    "model did not return JSON: {}",
                    content.chars().take(120).collect::<String>()
                ),
                retryable: false,
            }
        })?;

        self.cache.put(key, value.clone()).await;
        Ok(value)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let _permit = self.limiter.acquire().await;
        let response = self
            .client
            .post(self.url("/embeddings"))
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({"model": self.embedding_model, "input": texts}))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Llm {
                message: format!("embeddings HTTP {status}"),
                retryable: status.as_u16() == 429 || status.is_server_error(),
            });
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| EngineError::Llm {
            message: format!("unparseable embedding response: {e}"),
            retryable: false,
        })?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

fn transport_error(err: reqwest::Error) -> EngineError {
    EngineError::Llm {
        message: format!("transport error: {err}"),
        retryable: true,
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}
