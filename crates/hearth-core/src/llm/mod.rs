//! LLM client trait and its shared plumbing (rate limiting, response
//! caching, usage accounting).

pub mod cache;
pub mod rate_limit;

use hearth_types::error::EngineError;
use serde_json::Value;

/// Sampling options for one chat call.
#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1024,
        }
    }
}

impl ChatOptions {
    /// Options the analysis loop uses: low temperature, small budget.
    pub fn planning() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 800,
        }
    }

    /// Options for the final reply.
    pub fn response() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

/// Unified chat/embedding client.
///
/// Uses native async fn in traits (RPITIT); implementations live in
/// `hearth-infra::llm`.
pub trait LlmClient: Send + Sync {
    /// Free-text completion.
    fn chat_text(
        &self,
        system: &str,
        user: &str,
        opts: ChatOptions,
    ) -> impl std::future::Future<Output = Result<String, EngineError>> + Send;

    /// JSON-shaped completion. Implementations must recover a JSON object
    /// from sloppy output where possible.
    fn chat_json(
        &self,
        system: &str,
        user: &str,
        opts: ChatOptions,
    ) -> impl std::future::Future<Output = Result<Value, EngineError>> + Send;

    /// Embed one or more texts. One vector per input.
    fn embed(
        &self,
        texts: &[String],
    ) -> impl std::future::Future<Output = Result<Vec<Vec<f32>>, EngineError>> + Send;
}

/// Recover a JSON value from LLM output that may wrap the object in prose
/// or code fences. Tries a direct parse first, then the outermost `{...}`,
/// then the outermost `[...]`.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if end > start {
                if let Ok(value) = serde_json::from_str(&text[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}
