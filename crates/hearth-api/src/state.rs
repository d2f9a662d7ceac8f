//! Application state: the concrete engine wiring.
//!
//! Core services are generic over the I/O traits; this module pins them to
//! the infra implementations and builds everything once at startup.

use std::path::Path;
use std::sync::Arc;

use secrecy::SecretString;
use serde::Deserialize;
use sqlx::postgres::PgPool;
use tracing::{info, warn};

use hearth_core::context::ContextManager;
use hearth_core::embedding::{Embedder, EmbeddingService};
use hearth_core::engine::analysis::AnalysisEngine;
use hearth_core::engine::orchestrator::Orchestrator;
use hearth_core::engine::responder::Responder;
use hearth_core::executor::ToolExecutor;
use hearth_core::experiment::ExperimentEngine;
use hearth_core::prompt::{PromptAssembler, catalog};
use hearth_core::scope::ScopeResolver;
use hearth_infra::llm::embedding::{ChainEmbedder, FastEmbedEmbedder, RemoteEmbedder};
use hearth_infra::llm::openai_compat::OpenAiCompatClient;
use hearth_infra::postgres::household::CachedHouseholdDirectory;
use hearth_infra::postgres::principal::PrincipalStore;
use hearth_infra::tools::HttpToolClient;
use hearth_types::config::EngineConfig;
use hearth_types::error::EngineError;
use hearth_types::experiment::ExperimentConfig;

/// Embedding provider selection happens at startup; the engine sees one
/// type either way.
pub enum AnyEmbedder {
    /// Local fastembed model with a remote fallback.
    Chain(ChainEmbedder<FastEmbedEmbedder, RemoteEmbedder>),
    /// Remote only (no local model configured or it failed to load).
    Remote(RemoteEmbedder),
}

impl Embedder for AnyEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        match self {
            AnyEmbedder::Chain(chain) => chain.embed(texts).await,
            AnyEmbedder::Remote(remote) => remote.embed(texts).await,
        }
    }

    fn model_name(&self) -> &str {
        match self {
            AnyEmbedder::Chain(chain) => chain.model_name(),
            AnyEmbedder::Remote(remote) => remote.model_name(),
        }
    }

    fn dimension(&self) -> usize {
        match self {
            AnyEmbedder::Chain(chain) => chain.dimension(),
            AnyEmbedder::Remote(remote) => remote.dimension(),
        }
    }
}

pub type ConcreteOrchestrator =
    Orchestrator<OpenAiCompatClient, HttpToolClient, AnyEmbedder, CachedHouseholdDirectory>;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ConcreteOrchestrator>,
    pub principals: PrincipalStore,
    pub tools: Arc<HttpToolClient>,
    pub pool: PgPool,
    pub config: Arc<EngineConfig>,
}

impl AppState {
    pub async fn init(config: EngineConfig) -> anyhow::Result<Self> {
        let pool = hearth_infra::postgres::connect(&config.database_url).await?;

        // The configured family principal set must exist before the tool
        // service's foreign keys see traffic.
        let principals = PrincipalStore::new(pool.clone());
        principals.ensure_many(&config.family_shared_user_ids).await?;

        let llm = Arc::new(OpenAiCompatClient::new(
            SecretString::from(config.openai_api_key.clone()),
            config.openai_base_url.clone(),
            config.openai_model.clone(),
            config.openai_embedding_model.clone(),
            config.llm_rpm_limit,
            config.llm_concurrency,
            config.llm_cache_ttl,
            config.llm_cache_max_items,
        ));

        let embedder = Arc::new(build_embedder(&config));
        info!(
            model = embedder.model_name(),
            dimension = embedder.dimension(),
            "embedding provider ready"
        );
        let embeddings = Arc::new(EmbeddingService::new(
            Arc::clone(&embedder),
            config.emb_cache_max_items,
            config.emb_cache_ttl,
        ));

        let tools = Arc::new(HttpToolClient::new(config.tool_service_url.clone()));
        let household = Arc::new(CachedHouseholdDirectory::new(
            pool.clone(),
            config.family_shared_user_ids.clone(),
        ));
        let resolver = ScopeResolver::new(config.family_shared_user_ids.clone());

        let prompt_catalog = catalog::load_or_default(Path::new(&config.prompt_catalog_path));
        let prompts = Arc::new(PromptAssembler::new(
            prompt_catalog,
            std::time::Duration::from_secs(60),
        ));
        let experiments = Arc::new(ExperimentEngine::new(
            load_experiments(),
            prompts.current_variant().to_string(),
        ));

        let context = Arc::new(ContextManager::new(
            Arc::clone(&tools),
            Arc::clone(&embeddings),
            Arc::clone(&household),
            resolver.clone(),
        ));
        let analysis = AnalysisEngine::new(
            Arc::clone(&llm),
            Arc::clone(&context),
            Arc::clone(&prompts),
        );
        let executor = ToolExecutor::new(
            Arc::clone(&tools),
            Arc::clone(&embeddings),
            resolver,
            config.verify_max_refinements,
        );
        let responder = Responder::new(Arc::clone(&llm), Arc::clone(&prompts));

        let orchestrator = Arc::new(Orchestrator::new(
            analysis,
            executor,
            responder,
            context,
            Arc::clone(&tools),
            embeddings,
            experiments,
            llm,
            config.default_timezone.clone(),
            config.summary_turn_threshold,
        ));

        Ok(Self {
            orchestrator,
            principals,
            tools,
            pool,
            config: Arc::new(config),
        })
    }
}

fn build_embedder(config: &EngineConfig) -> AnyEmbedder {
    let remote = RemoteEmbedder::new(
        SecretString::from(config.openai_api_key.clone()),
        config.openai_base_url.clone(),
        config.openai_embedding_model.clone(),
        1536,
    );

    if config.embed_provider == "local_fastembed" {
        let cache_dir = std::env::var("FASTEMBED_CACHE_DIR")
            .map(Into::into)
            .unwrap_or_else(|_| std::env::temp_dir().join("hearth-models"));
        match FastEmbedEmbedder::new(&config.fastembed_model, cache_dir) {
            Ok(local) => return AnyEmbedder::Chain(ChainEmbedder::new(local, remote)),
            Err(err) => {
                warn!(error = %err, "local embedding model unavailable, using remote embeddings");
            }
        }
    }
    AnyEmbedder::Remote(remote)
}

#[derive(Deserialize, Default)]
struct ExperimentsFile {
    #[serde(default)]
    experiments: Vec<ExperimentConfig>,
}

/// Experiments live in an optional TOML file next to the prompt catalog.
fn load_experiments() -> Vec<ExperimentConfig> {
    let Some(path) = std::env::var("EXPERIMENTS_PATH").ok().filter(|p| !p.is_empty()) else {
        return Vec::new();
    };
    match std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|raw| toml::from_str::<ExperimentsFile>(&raw).map_err(|e| e.to_string()))
    {
        Ok(file) => {
            info!(path = %path, count = file.experiments.len(), "experiments loaded");
            file.experiments
        }
        Err(err) => {
            warn!(path = %path, error = %err, "experiments file unreadable, running without");
            Vec::new()
        }
    }
}
