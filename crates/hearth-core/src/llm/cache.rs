//! Short-TTL response cache for chat calls.
//!
//! Deduplicates identical `(system, user, options)` requests within a small
//! window. Keys are SHA-256 digests so full prompts never sit in the map.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

struct Entry {
    value: Value,
    inserted_at: Instant,
}

/// TTL + capacity bounded cache for LLM responses.
pub struct ResponseCache {
    ttl: Duration,
    max_items: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_items: usize) -> Self {
        Self {
            ttl,
            max_items: max_items.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cache key over the full request shape.
    pub fn key(kind: &str, system: &str, user: &str, temperature: f32, max_tokens: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update([0]);
        hasher.update(system.as_bytes());
        hasher.update([0]);
        hasher.update(user.as_bytes());
        hasher.update([0]);
        hasher.update(temperature.to_le_bytes());
        hasher.update(max_tokens.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, key: String, value: Value) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_items {
            // Evict expired entries first; if still full, drop the oldest.
            let ttl = self.ttl;
            entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
            if entries.len() >= self.max_items {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub async fn flush(&self) {
        self.entries.lock().await.clear();
    }
}
