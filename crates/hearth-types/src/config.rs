//! Environment-driven configuration.

use std::time::Duration;

use uuid::Uuid;

use crate::error::EngineError;
use crate::principal;

/// Engine configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub tool_service_url: String,

    pub llm_provider_name: String,
    pub openai_api_key: String,
    pub openai_base_url: Option<String>,
    pub openai_model: String,
    pub openai_embedding_model: String,
    pub llm_rpm_limit: u32,
    pub llm_concurrency: u32,
    pub llm_cache_ttl: Duration,
    pub llm_cache_max_items: usize,

    pub embed_provider: String,
    pub fastembed_model: String,

    /// Principal keys (or raw UUIDs) sharing family-scoped data.
    pub family_shared_user_ids: Vec<Uuid>,

    pub strict_mode: bool,
    pub emb_cache_max_items: usize,
    pub emb_cache_ttl: Duration,

    pub media_root: String,
    pub signing_secret: Option<String>,

    pub default_timezone: String,

    /// Per-message deadline.
    pub message_deadline: Duration,
    /// Turns on a thread before an opportunistic summary is written.
    pub summary_turn_threshold: u32,
    /// Extra retrieval attempts the verification loop may make.
    pub verify_max_refinements: u8,
    /// Prompt catalog path.
    pub prompt_catalog_path: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load configuration from the environment.
    ///
    /// `DATABASE_URL` is the only hard requirement; everything else has a
    /// development default.
    pub fn from_env() -> Result<Self, EngineError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| EngineError::Configuration("DATABASE_URL is not set".to_string()))?;

        let family_shared_user_ids = parse_family_ids(&env_or("FAMILY_SHARED_USER_IDS", ""));

        Ok(Self {
            database_url,
            tool_service_url: env_or("TOOL_SERVICE_URL", "http://localhost:8100"),
            llm_provider_name: env_or("LLM_PROVIDER_NAME", "openai"),
            openai_api_key: env_or("OPENAI_API_KEY", ""),
            openai_base_url: std::env::var("OPENAI_BASE_URL").ok().filter(|s| !s.is_empty()),
            openai_model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
            openai_embedding_model: env_or("OPENAI_EMBEDDING_MODEL", "text-embedding-3-small"),
            llm_rpm_limit: env_parse("LLM_RPM_LIMIT", 60),
            llm_concurrency: env_parse("LLM_CONCURRENCY", 4),
            llm_cache_ttl: Duration::from_secs_f64(env_parse("LLM_CACHE_TTL_SECONDS", 30.0)),
            llm_cache_max_items: env_parse("LLM_CACHE_MAX_ITEMS", 512),
            embed_provider: env_or("EMBED_PROVIDER", "local_fastembed"),
            fastembed_model: env_or("FASTEMBED_MODEL", "BAAI/bge-small-zh-v1.5"),
            family_shared_user_ids,
            strict_mode: env_parse("MCP_STRICT_MODE", false),
            emb_cache_max_items: env_parse("EMB_CACHE_MAX_ITEMS", 1000),
            emb_cache_ttl: Duration::from_secs_f64(env_parse("EMB_CACHE_TTL_SECONDS", 3600.0)),
            media_root: env_or("MEDIA_ROOT", "/data/media"),
            signing_secret: std::env::var("SIGNING_SECRET").ok().filter(|s| !s.is_empty()),
            default_timezone: env_or("DEFAULT_TIMEZONE", "Asia/Shanghai"),
            message_deadline: Duration::from_secs_f64(env_parse("MESSAGE_DEADLINE_SECONDS", 20.0)),
            summary_turn_threshold: env_parse("SUMMARY_TURN_THRESHOLD", 6),
            verify_max_refinements: env_parse("VERIFY_MAX_REFINEMENTS", 2),
            prompt_catalog_path: env_or("PROMPT_CATALOG_PATH", "prompts/hearth_prompts.toml"),
        })
    }
}

/// Parse the `FAMILY_SHARED_USER_IDS` value: a JSON list or a comma list of
/// principal keys / UUIDs. The `family_default` principal is always part of
/// the set.
pub fn parse_family_ids(raw: &str) -> Vec<Uuid> {
    let mut ids = vec![principal::family_default_id()];
    let keys: Vec<String> = match serde_json::from_str::<Vec<String>>(raw) {
        Ok(list) => list,
        Err(_) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    };
    for key in keys {
        let id = principal::principal_id_for_key(&key);
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_family_ids_json_list() {
        let ids = parse_family_ids(r#"["dad", "mom"]"#);
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], principal::family_default_id());
        assert!(ids.contains(&principal::principal_id_for_key("dad")));
        assert!(ids.contains(&principal::principal_id_for_key("mom")));
    }

    #[test]
    fn test_parse_family_ids_comma_list() {
        let ids = parse_family_ids("dad, mom ,");
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_parse_family_ids_empty_keeps_family_default() {
        let ids = parse_family_ids("");
        assert_eq!(ids, vec![principal::family_default_id()]);
    }

    #[test]
    fn test_parse_family_ids_dedupes() {
        let ids = parse_family_ids("dad,dad,family_default");
        assert_eq!(ids.len(), 2);
    }
}
