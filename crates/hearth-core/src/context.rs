//! Context manager: basic per-message context plus on-demand resolution of
//! the LLM's `context_requests`.
//!
//! Requests inside one analysis round resolve in parallel and inherit the
//! message trace id. Individual failures degrade to empty results; the
//! round only aborts when every declared request failed.

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hearth_types::analysis::{ContextRequest, ContextRequestKind};
use hearth_types::error::EngineError;
use hearth_types::household::HouseholdView;
use hearth_types::scope::ScopeTarget;
use hearth_types::tool::TOOL_SEARCH;

use crate::embedding::{Embedder, EmbeddingService, TraceCache};
use crate::household::HouseholdDirectory;
use crate::scope::ScopeResolver;
use crate::tool::ToolClient;

/// Default number of recent turns in the light context.
pub const LIGHT_CONTEXT_LIMIT: u32 = 4;
/// Default hit count for a semantic search request.
const SEMANTIC_DEFAULT_LIMIT: u32 = 5;
/// Default hit count for recent/direct requests.
const RECENT_DEFAULT_LIMIT: u32 = 6;
const DIRECT_DEFAULT_LIMIT: u32 = 20;

/// Context fetched once per message before the first analysis round.
#[derive(Debug, Clone, Default)]
pub struct BasicContext {
    /// Most recent turns, in chronological order.
    pub light_context: Vec<Value>,
    pub household: HouseholdView,
    pub thread_summary: Option<Value>,
}

/// Per-message retrieval facts threaded through every request.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalScope<'a> {
    pub principal: Uuid,
    pub thread_id: Option<&'a str>,
    pub shared_thread: bool,
    pub channel: Option<&'a str>,
}

pub struct ContextManager<T, E, H> {
    tools: Arc<T>,
    embeddings: Arc<EmbeddingService<E>>,
    household: Arc<H>,
    resolver: ScopeResolver,
}

impl<T, E, H> ContextManager<T, E, H>
where
    T: ToolClient,
    E: Embedder,
    H: HouseholdDirectory,
{
    pub fn new(
        tools: Arc<T>,
        embeddings: Arc<EmbeddingService<E>>,
        household: Arc<H>,
        resolver: ScopeResolver,
    ) -> Self {
        Self {
            tools,
            embeddings,
            household,
            resolver,
        }
    }

    /// Fetch the basic context. The three fetches run concurrently; each
    /// degrades independently so a slow household view never blocks the
    /// recent turns.
    pub async fn basic_context(&self, scope: RetrievalScope<'_>, trace_id: Uuid) -> BasicContext {
        let started = std::time::Instant::now();

        let (light, household, summary) = tokio::join!(
            self.recent_turns(scope, LIGHT_CONTEXT_LIMIT),
            self.household.view(),
            self.latest_thread_summary(scope),
        );

        let light_context = match light {
            Ok(mut rows) => {
                // Newest-first from the store; the prompt wants them in
                // chronological order.
                rows.reverse();
                rows
            }
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "light context fetch failed");
                Vec::new()
            }
        };

        let household = match household {
            Ok(view) => view,
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "household view fetch failed");
                HouseholdView::default()
            }
        };

        let thread_summary = match summary {
            Ok(value) => value,
            Err(err) => {
                debug!(trace_id = %trace_id, error = %err, "thread summary unavailable");
                None
            }
        };

        info!(
            trace_id = %trace_id,
            duration_ms = started.elapsed().as_millis() as u64,
            light = light_context.len(),
            members = household.members.len(),
            "step.basic_context.completed"
        );

        BasicContext {
            light_context,
            household,
            thread_summary,
        }
    }

    /// Resolve the LLM's context requests in parallel.
    ///
    /// Returns the payload keyed by request name. Individual failures land
    /// as empty arrays; when *every* request failed the whole resolution is
    /// a `ContextResolutionError` and the analysis round aborts.
    pub async fn resolve_requests(
        &self,
        requests: &[ContextRequest],
        scope: RetrievalScope<'_>,
        household: &HouseholdView,
        trace: &TraceCache,
        trace_id: Uuid,
    ) -> Result<Map<String, Value>, EngineError> {
        if requests.is_empty() {
            return Ok(Map::new());
        }
        info!(
            trace_id = %trace_id,
            count = requests.len(),
            kinds = ?requests.iter().map(|r| r.kind).collect::<Vec<_>>(),
            "resolving context requests"
        );

        let futures = requests.iter().map(|request| async move {
            let started = std::time::Instant::now();
            let outcome = self.resolve_one(request, scope, household, trace).await;
            (request, outcome, started.elapsed().as_millis() as u64)
        });

        let mut resolved = Map::new();
        let mut failures = 0usize;
        for (request, outcome, duration_ms) in join_all(futures).await {
            match outcome {
                Ok(value) => {
                    debug!(trace_id = %trace_id, name = %request.name, duration_ms, "context request resolved");
                    resolved.insert(request.name.clone(), value);
                }
                Err(err) => {
                    warn!(trace_id = %trace_id, name = %request.name, error = %err, "context request failed");
                    failures += 1;
                    resolved.insert(request.name.clone(), json!([]));
                }
            }
        }

        if failures == requests.len() {
            return Err(EngineError::ContextResolution {
                name: requests[0].name.clone(),
                message: format!("all {failures} context requests failed"),
            });
        }
        Ok(resolved)
    }

    async fn resolve_one(
        &self,
        request: &ContextRequest,
        scope: RetrievalScope<'_>,
        household: &HouseholdView,
        trace: &TraceCache,
    ) -> Result<Value, EngineError> {
        let target = self.request_target(request, scope, household)?;

        match request.kind {
            ContextRequestKind::RecentMemories => {
                let limit = request.limit.unwrap_or(RECENT_DEFAULT_LIMIT);
                let search_args =
                    self.search_args(&target, scope, request.filters.clone(), limit, None, None);
                self.search(search_args).await
            }
            ContextRequestKind::SemanticSearch => {
                let query = request.query.clone().unwrap_or_default();
                if query.is_empty() {
                    return Ok(json!([]));
                }
                let limit = request.limit.unwrap_or(SEMANTIC_DEFAULT_LIMIT);
                let embedding = self.embeddings.embed_one_lenient(trace, &query).await;
                let search_args = self.search_args(
                    &target,
                    scope,
                    request.filters.clone(),
                    limit,
                    Some(query),
                    embedding,
                );
                self.search(search_args).await
            }
            ContextRequestKind::DirectSearch => {
                let limit = request.limit.unwrap_or(DIRECT_DEFAULT_LIMIT);
                let search_args =
                    self.search_args(&target, scope, request.filters.clone(), limit, None, None);
                self.search(search_args).await
            }
            ContextRequestKind::ThreadSummaries => {
                let Some(thread_id) = scope.thread_id else {
                    return Ok(json!([]));
                };
                let search_args = json!({
                    "user_id": scope.principal.to_string(),
                    "filters": {
                        "thread_id": thread_id,
                        "type": "thread_summary",
                        "limit": request.limit.unwrap_or(1),
                    }
                });
                self.search(search_args).await
            }
        }
    }

    /// Scope for one request: an explicit `scope` field wins, otherwise the
    /// current principal.
    fn request_target(
        &self,
        request: &ContextRequest,
        scope: RetrievalScope<'_>,
        household: &HouseholdView,
    ) -> Result<ScopeTarget, EngineError> {
        match request.scope {
            Some(declared) => self
                .resolver
                .resolve(
                    declared,
                    request.person_key.as_deref(),
                    scope.principal,
                    scope.thread_id,
                    household,
                )
                .map_err(|err| EngineError::ContextResolution {
                    name: request.name.clone(),
                    message: err.to_string(),
                }),
            None => Ok(ScopeTarget {
                user_ids: vec![scope.principal],
                thread_filter: None,
            }),
        }
    }

    fn search_args(
        &self,
        target: &ScopeTarget,
        scope: RetrievalScope<'_>,
        filters: Option<Value>,
        limit: u32,
        query: Option<String>,
        embedding: Option<Vec<f32>>,
    ) -> Value {
        let mut filter_map = match filters {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        filter_map.insert("limit".to_string(), json!(limit));
        if scope.shared_thread {
            filter_map.entry("shared_thread".to_string()).or_insert(json!(true));
        }
        if let Some(thread_id) = &target.thread_filter {
            filter_map
                .entry("thread_id".to_string())
                .or_insert_with(|| json!(thread_id));
        }

        let user_id = if target.user_ids.len() == 1 {
            json!(target.user_ids[0].to_string())
        } else {
            json!(target.user_ids.iter().map(Uuid::to_string).collect::<Vec<_>>())
        };

        let mut search_args = Map::new();
        search_args.insert("user_id".to_string(), user_id);
        search_args.insert("filters".to_string(), Value::Object(filter_map));
        if let Some(query) = query {
            search_args.insert("query".to_string(), json!(query));
        }
        if let Some(embedding) = embedding {
            search_args.insert("query_embedding".to_string(), json!(embedding));
        }
        Value::Object(search_args)
    }

    /// Most recent turns for the light context: thread-scoped when a
    /// thread id is present, global otherwise.
    async fn recent_turns(
        &self,
        scope: RetrievalScope<'_>,
        limit: u32,
    ) -> Result<Vec<Value>, EngineError> {
        let mut filters = Map::new();
        filters.insert("limit".to_string(), json!(limit));
        if let Some(thread_id) = scope.thread_id {
            filters.insert("thread_id".to_string(), json!(thread_id));
            filters.insert("type".to_string(), json!("chat_turn"));
            if scope.shared_thread {
                filters.insert("shared_thread".to_string(), json!(true));
            }
            if let Some(channel) = scope.channel {
                filters.insert("channel".to_string(), json!(channel));
            }
        }
        let search_args = json!({
            "user_id": scope.principal.to_string(),
            "filters": filters,
        });
        let result = self.search(search_args).await?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }

    async fn latest_thread_summary(
        &self,
        scope: RetrievalScope<'_>,
    ) -> Result<Option<Value>, EngineError> {
        let Some(thread_id) = scope.thread_id else {
            return Ok(None);
        };
        let search_args = json!({
            "user_id": scope.principal.to_string(),
            "filters": {"thread_id": thread_id, "type": "thread_summary", "limit": 1}
        });
        let result = self.search(search_args).await?;
        Ok(result.as_array().and_then(|rows| rows.first().cloned()))
    }

    /// Run a search and unwrap the `results` array.
    async fn search(&self, search_args: Value) -> Result<Value, EngineError> {
        let output = self.tools.call(TOOL_SEARCH, search_args).await?;
        if let Some(envelope) = output.get("error") {
            return Err(EngineError::ToolService {
                kind: envelope
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or("internal")
                    .to_string(),
                message: envelope
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("search failed")
                    .to_string(),
            });
        }
        Ok(output.get("results").cloned().unwrap_or(json!([])))
    }
}
