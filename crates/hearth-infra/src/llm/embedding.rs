//! Embedding providers: local fastembed model preferred, OpenAI-compatible
//! remote as fallback.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fastembed::{EmbeddingModel, TextEmbedding, TextInitOptions};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use hearth_core::embedding::Embedder;
use hearth_types::error::EngineError;

/// Local embedding generator backed by fastembed's ONNX runtime.
///
/// `TextEmbedding::embed` needs `&mut self` and is CPU-bound, so the model
/// sits behind a mutex that is only held inside `spawn_blocking`.
pub struct FastEmbedEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    model_name: String,
    dimension: usize,
}

impl FastEmbedEmbedder {
    /// Load a model by its published name. Downloads on first use into
    /// `{cache_dir}`; subsequent starts reuse the cached files.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EngineError> {
        let (model, dimension) = resolve_model(model_name)?;
        let embedding = TextEmbedding::try_new(
            TextInitOptions::new(model)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(false),
        )
        .map_err(|e| EngineError::Configuration(format!("failed to load embedding model: {e}")))?;

        Ok(Self {
            model: Arc::new(Mutex::new(embedding)),
            model_name: model_name.to_string(),
            dimension,
        })
    }
}

fn resolve_model(name: &str) -> Result<(EmbeddingModel, usize), EngineError> {
    match name {
        "BAAI/bge-small-zh-v1.5" => Ok((EmbeddingModel::BGESmallZHV15, 512)),
        "BAAI/bge-small-en-v1.5" => Ok((EmbeddingModel::BGESmallENV15, 384)),
        other => Err(EngineError::Configuration(format!(
            "unsupported fastembed model '{other}'"
        ))),
    }
}

impl Embedder for FastEmbedEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let texts_owned: Vec<String> = texts.to_vec();
        let model = Arc::clone(&self.model);

        tokio::task::spawn_blocking(move || {
            let mut model = model.lock().map_err(|e| EngineError::Llm {
                message: format!("embedding model lock poisoned: {e}"),
                retryable: false,
            })?;
            model.embed(texts_owned, None).map_err(|e| EngineError::Llm {
                message: format!("embedding generation failed: {e}"),
                retryable: true,
            })
        })
        .await
        .map_err(|e| EngineError::Llm {
            message: format!("embedding task panicked: {e}"),
            retryable: false,
        })?
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Remote embeddings over an OpenAI-compatible `/embeddings` endpoint.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    dimension: usize,
}

impl RemoteEmbedder {
    pub fn new(
        api_key: SecretString,
        base_url: Option<String>,
        model: String,
        dimension: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model,
            dimension,
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl Embedder for RemoteEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url.trim_end_matches('/')))
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({"model": self.model, "input": texts}))
            .send()
            .await
            .map_err(|e| EngineError::Llm {
                message: format!("embedding transport error: {e}"),
                retryable: true,
            })?;

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

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Primary-then-fallback chain. The remote fallback only fires when the
/// local model errors, keeping the hot path off the network.
pub struct ChainEmbedder<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> ChainEmbedder<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

impl<P: Embedder, F: Embedder> Embedder for ChainEmbedder<P, F> {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        match self.primary.embed(texts).await {
            Ok(vectors) => Ok(vectors),
            Err(err) => {
                warn!(error = %err, "primary embedder failed, trying fallback");
                self.fallback.embed(texts).await
            }
        }
    }

    fn model_name(&self) -> &str {
        self.primary.model_name()
    }

    fn dimension(&self) -> usize {
        self.primary.dimension()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    struct BrokenEmbedder;

    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
            Err(EngineError::Llm {
                message: "model not loaded".to_string(),
                retryable: true,
            })
        }

        fn model_name(&self) -> &str {
            "broken"
        }

        fn dimension(&self) -> usize {
            512
        }
    }

    struct WorkingEmbedder;

    impl Embedder for WorkingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
            Ok(texts.iter().map(|_| vec![1.0, 2.0]).collect())
        }

        fn model_name(&self) -> &str {
            "working"
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_resolve_model_dimensions() {
        assert_eq!(resolve_model("BAAI/bge-small-zh-v1.5").unwrap().1, 512);
        assert_eq!(resolve_model("BAAI/bge-small-en-v1.5").unwrap().1, 384);
        assert!(resolve_model("made-up/model").is_err());
    }

    #[tokio::test]
    async fn test_chain_uses_primary_when_healthy() {
        let chain = ChainEmbedder::new(WorkingEmbedder, BrokenEmbedder);
        let vectors = chain.embed(&["hi".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 2.0]]);
        assert_eq!(chain.model_name(), "working");
    }

    #[tokio::test]
    async fn test_chain_falls_back_on_primary_failure() {
        let chain = ChainEmbedder::new(BrokenEmbedder, WorkingEmbedder);
        let vectors = chain.embed(&["hi".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 2.0]]);
    }

    #[tokio::test]
    async fn test_remote_embedder_round_trip() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(200)
                    .json_body(serde_json::json!({"data": [{"embedding": [0.5, 0.6]}]}));
            })
            .await;

        let remote = RemoteEmbedder::new(
            SecretString::from("k".to_string()),
            Some(server.base_url()),
            "test-embed".to_string(),
            2,
        );
        let vectors = remote.embed(&["x".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![0.5, 0.6]]);
    }
}
