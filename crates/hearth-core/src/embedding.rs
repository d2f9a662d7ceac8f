//! Embedding provider trait and the two-layer embedding cache.
//!
//! Layer 1 is a per-trace map created when a message begins and dropped
//! when it ends. Layer 2 is a process-wide LRU with TTL. Cache keys are the
//! exact input strings. Neither layer persists to disk.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hearth_types::error::EngineError;
use tokio::sync::Mutex;
use tracing::debug;

/// Text-to-vector provider. Implementations live in `hearth-infra`
/// (fastembed local model, OpenAI-compatible remote fallback).
pub trait Embedder: Send + Sync {
    fn embed(
        &self,
        texts: &[String],
    ) -> impl std::future::Future<Output = Result<Vec<Vec<f32>>, EngineError>> + Send;

    fn model_name(&self) -> &str;

    fn dimension(&self) -> usize;
}

struct LruEntry {
    vector: Vec<f32>,
    inserted_at: Instant,
    last_used: Instant,
}

/// Process-wide LRU with TTL.
pub struct EmbeddingCache {
    max_items: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, LruEntry>>,
}

impl EmbeddingCache {
    pub fn new(max_items: usize, ttl: Duration) -> Self {
        Self {
            max_items: max_items.max(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, text: &str) -> Option<Vec<f32>> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(text) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                entry.last_used = Instant::now();
                Some(entry.vector.clone())
            }
            Some(_) => {
                entries.remove(text);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, text: String, vector: Vec<f32>) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_items && !entries.contains_key(&text) {
            if let Some(lru_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru_key);
            }
        }
        let now = Instant::now();
        entries.insert(
            text,
            LruEntry {
                vector,
                inserted_at: now,
                last_used: now,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn flush(&self) {
        self.entries.lock().await.clear();
    }
}

/// Per-message deduplication layer.
#[derive(Default)]
pub struct TraceCache {
    entries: Mutex<HashMap<String, Vec<f32>>>,
}

impl TraceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.entries.lock().await.get(text).cloned()
    }

    pub async fn put(&self, text: String, vector: Vec<f32>) {
        self.entries.lock().await.insert(text, vector);
    }
}

/// Cache-fronted embedding service: trace cache → global LRU → provider.
pub struct EmbeddingService<E> {
    provider: Arc<E>,
    global: EmbeddingCache,
}

impl<E: Embedder> EmbeddingService<E> {
    pub fn new(provider: Arc<E>, max_items: usize, ttl: Duration) -> Self {
        Self {
            provider,
            global: EmbeddingCache::new(max_items, ttl),
        }
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    /// Embed one text. Errors propagate; degraded callers (e.g. search)
    /// should use [`Self::embed_one_lenient`].
    pub async fn embed_one(
        &self,
        trace: &TraceCache,
        text: &str,
    ) -> Result<Vec<f32>, EngineError> {
        if let Some(vector) = trace.get(text).await {
            return Ok(vector);
        }
        if let Some(vector) = self.global.get(text).await {
            trace.put(text.to_string(), vector.clone()).await;
            return Ok(vector);
        }

        let vectors = self.provider.embed(std::slice::from_ref(&text.to_string())).await?;
        let vector = vectors.into_iter().next().ok_or_else(|| EngineError::Llm {
            message: "embedding provider returned no vector".to_string(),
            retryable: false,
        })?;

        self.global.put(text.to_string(), vector.clone()).await;
        trace.put(text.to_string(), vector.clone()).await;
        Ok(vector)
    }

    /// Embed one text, returning `None` on provider failure so retrieval
    /// can degrade to predicate-only search.
    pub async fn embed_one_lenient(&self, trace: &TraceCache, text: &str) -> Option<Vec<f32>> {
        match self.embed_one(trace, text).await {
            Ok(vector) => Some(vector),
            Err(err) => {
                debug!(error = %err, "embedding failed, continuing without vector");
                None
            }
        }
    }

    pub async fn cached_items(&self) -> usize {
        self.global.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingEmbedder {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl Embedder for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::Llm {
                    message: "provider down".to_string(),
                    retryable: true,
                });
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn model_name(&self) -> &str {
            "counting"
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn test_same_text_embedded_once_per_trace() {
        let provider = Arc::new(CountingEmbedder::new(false));
        let service = EmbeddingService::new(Arc::clone(&provider), 10, Duration::from_secs(60));
        let trace = TraceCache::new();

        let a = service.embed_one(&trace, "今天买菜花了80元").await.unwrap();
        let b = service.embed_one(&trace, "今天买菜花了80元").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_global_cache_survives_trace_teardown() {
        let provider = Arc::new(CountingEmbedder::new(false));
        let service = EmbeddingService::new(Arc::clone(&provider), 10, Duration::from_secs(60));

        {
            let trace = TraceCache::new();
            service.embed_one(&trace, "hello").await.unwrap();
        }
        {
            let trace = TraceCache::new();
            service.embed_one(&trace, "hello").await.unwrap();
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lenient_path_swallows_provider_failure() {
        let provider = Arc::new(CountingEmbedder::new(true));
        let service = EmbeddingService::new(provider, 10, Duration::from_secs(60));
        let trace = TraceCache::new();
        assert!(service.embed_one_lenient(&trace, "query").await.is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_recently_used() {
        let cache = EmbeddingCache::new(2, Duration::from_secs(60));
        cache.put("a".to_string(), vec![1.0]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.put("b".to_string(), vec![2.0]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Touch "a" so "b" becomes the LRU entry.
        cache.get("a").await.unwrap();
        cache.put("c".to_string(), vec![3.0]).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = EmbeddingCache::new(10, Duration::from_millis(20));
        cache.put("x".to_string(), vec![1.0]).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("x").await.is_none());
    }
}
