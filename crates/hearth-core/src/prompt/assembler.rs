//! Prompt assembly: concatenate a variant's blocks for a phase and inject
//! the live tool catalog.
//!
//! `{{DYNAMIC_TOOLS}}` becomes a compact one-line-per-tool listing;
//! `{{DYNAMIC_TOOL_SPECS}}` becomes the full JSON specs. Assembled prompts
//! are cached per `(variant, phase, channel, tool-spec hash)` with a short
//! TTL so spec changes propagate without a restart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hearth_types::prompt::{PromptCatalog, PromptPhase, PromptVariant};
use hearth_types::tool::ToolSpec;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

const DYNAMIC_TOOLS: &str = "{{DYNAMIC_TOOLS}}";
const DYNAMIC_TOOL_SPECS: &str = "{{DYNAMIC_TOOL_SPECS}}";

pub struct PromptAssembler {
    catalog: PromptCatalog,
    ttl: Duration,
    cache: Mutex<HashMap<String, (String, Instant)>>,
}

impl PromptAssembler {
    pub fn new(catalog: PromptCatalog, ttl: Duration) -> Self {
        Self {
            catalog,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The variant the `current` pointer names.
    pub fn current_variant(&self) -> &str {
        &self.catalog.current
    }

    /// Look a variant up, falling back to `current` for unknown names so a
    /// stale experiment assignment cannot break a message.
    pub fn variant(&self, name: &str) -> &PromptVariant {
        self.catalog
            .prompts
            .get(name)
            .or_else(|| self.catalog.prompts.get(&self.catalog.current))
            .expect("catalog validated at load time")
    }

    /// Per-channel reply cap for a variant.
    pub fn reply_cap(&self, variant_name: &str, channel: Option<&str>) -> Option<usize> {
        self.variant(variant_name).reply_cap_for(channel)
    }

    /// Assemble the prompt for a phase.
    pub async fn assemble(
        &self,
        variant_name: &str,
        phase: PromptPhase,
        channel: Option<&str>,
        specs: &[ToolSpec],
    ) -> String {
        let key = cache_key(variant_name, phase, channel, specs);
        {
            let cache = self.cache.lock().await;
            if let Some((text, inserted_at)) = cache.get(&key) {
                if inserted_at.elapsed() < self.ttl {
                    return text.clone();
                }
            }
        }

        let variant = self.variant(variant_name);
        let blocks = variant.blocks_for(phase, channel);
        let joined = blocks
            .iter()
            .filter_map(|name| self.catalog.blocks.get(name))
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        let text = substitute_tools(&joined, specs);

        let mut cache = self.cache.lock().await;
        cache.retain(|_, (_, inserted_at)| inserted_at.elapsed() < self.ttl);
        cache.insert(key, (text.clone(), Instant::now()));
        text
    }

    pub async fn flush(&self) {
        self.cache.lock().await.clear();
    }
}

fn substitute_tools(text: &str, specs: &[ToolSpec]) -> String {
    let mut out = text.to_string();
    if out.contains(DYNAMIC_TOOLS) {
        out = out.replace(DYNAMIC_TOOLS, &compact_listing(specs));
    }
    if out.contains(DYNAMIC_TOOL_SPECS) {
        let full = serde_json::to_string_pretty(specs).unwrap_or_else(|_| "[]".to_string());
        out = out.replace(DYNAMIC_TOOL_SPECS, &full);
    }
    out
}

fn compact_listing(specs: &[ToolSpec]) -> String {
    if specs.is_empty() {
        return "(no tools available)".to_string();
    }
    specs
        .iter()
        .map(|spec| {
            format!(
                "- {}: {} [{}ms, {}]",
                spec.name, spec.description, spec.x_time_budget, spec.x_latency_hint
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn cache_key(
    variant_name: &str,
    phase: PromptPhase,
    channel: Option<&str>,
    specs: &[ToolSpec],
) -> String {
    let mut hasher = Sha256::new();
    for spec in specs {
        hasher.update(spec.name.as_bytes());
        hasher.update(spec.x_time_budget.to_le_bytes());
        if let Ok(schema) = serde_json::to_vec(&spec.input_schema) {
            hasher.update(&schema);
        }
    }
    format!(
        "{variant_name}:{phase:?}:{}:{:x}",
        channel.unwrap_or("-"),
        hasher.finalize()
    )
}
