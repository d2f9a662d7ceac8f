//! Tool plan execution.
//!
//! Steps run sequentially. Failures are captured into the result list as
//! `{error: {kind, message}}` entries and never abort the plan unless the
//! step is flagged mandatory. After the plan a bounded verification loop
//! may re-run an empty retrieval with progressively broader filters.

pub mod args;

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hearth_types::analysis::{PlanStep, ToolPlan, Understanding};
use hearth_types::error::EngineError;
use hearth_types::household::HouseholdView;
use hearth_types::scope::ScopeTarget;
use hearth_types::tool::{
    self, TOOL_AGGREGATE, TOOL_BATCH_AGGREGATE, TOOL_BATCH_SEARCH, TOOL_GET_PENDING_REMINDERS,
    TOOL_SCHEDULE_REMINDER, TOOL_SEARCH, TOOL_STORE, TOOL_UPDATE_MEMORY_FIELDS,
};

use crate::embedding::{Embedder, EmbeddingService, TraceCache};
use crate::scope::ScopeResolver;
use crate::tool::ToolClient;

/// Default cap on plan length.
pub const MAX_PLAN_STEPS: usize = 10;

const KNOWN_TOOLS: [&str; 13] = [
    tool::TOOL_STORE,
    tool::TOOL_SEARCH,
    tool::TOOL_AGGREGATE,
    tool::TOOL_UPDATE_MEMORY_FIELDS,
    tool::TOOL_SOFT_DELETE,
    tool::TOOL_SCHEDULE_REMINDER,
    tool::TOOL_GET_PENDING_REMINDERS,
    tool::TOOL_MARK_REMINDER_SENT,
    tool::TOOL_LIST_REMINDER_USER_IDS,
    tool::TOOL_BATCH_STORE,
    tool::TOOL_BATCH_SEARCH,
    tool::TOOL_BATCH_AGGREGATE,
    tool::TOOL_RENDER_CHART,
];

/// Tools whose argument shape carries `user_id` and may receive scope.
const SCOPED_TOOLS: [&str; 7] = [
    TOOL_STORE,
    TOOL_SEARCH,
    TOOL_AGGREGATE,
    TOOL_SCHEDULE_REMINDER,
    TOOL_GET_PENDING_REMINDERS,
    TOOL_BATCH_SEARCH,
    TOOL_BATCH_AGGREGATE,
];

/// Captured failure of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    pub kind: String,
    pub message: String,
}

/// Outcome of one step: exactly one of `output` / `error` is set.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub tool: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,

    pub elapsed_ms: u64,
}

impl StepResult {
    fn failed(tool: &str, kind: &str, message: String, elapsed_ms: u64) -> Self {
        Self {
            tool: tool.to_string(),
            output: None,
            error: Some(StepError {
                kind: kind.to_string(),
                message,
            }),
            elapsed_ms,
        }
    }
}

/// Result of running a whole plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub results: Vec<StepResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_store_id: Option<String>,

    pub verification_rounds: u8,
}

impl ExecutionReport {
    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| r.error.is_some())
    }
}

/// Executes tool plans against the tool service.
pub struct ToolExecutor<T, E> {
    tools: Arc<T>,
    embeddings: Arc<EmbeddingService<E>>,
    resolver: ScopeResolver,
    verify_max_refinements: u8,
}

impl<T: ToolClient, E: Embedder> ToolExecutor<T, E> {
    pub fn new(
        tools: Arc<T>,
        embeddings: Arc<EmbeddingService<E>>,
        resolver: ScopeResolver,
        verify_max_refinements: u8,
    ) -> Self {
        Self {
            tools,
            embeddings,
            resolver,
            verify_max_refinements,
        }
    }

    /// Run the plan. Never fails: step errors are captured into the report
    /// so the responder can acknowledge them.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        plan: &ToolPlan,
        understanding: &Understanding,
        current_principal: Uuid,
        thread_id: Option<&str>,
        household: &HouseholdView,
        context_payload: &Map<String, Value>,
        trace: &TraceCache,
        trace_id: Uuid,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let mut last_search_args: Option<Value> = None;

        let steps: &[PlanStep] = if plan.steps.len() > MAX_PLAN_STEPS {
            warn!(
                trace_id = %trace_id,
                declared = plan.steps.len(),
                cap = MAX_PLAN_STEPS,
                "tool plan exceeds the step cap, truncating"
            );
            &plan.steps[..MAX_PLAN_STEPS]
        } else {
            &plan.steps
        };

        for step in steps {
            let (result, dispatched) = self
                .run_step(
                    step,
                    understanding,
                    current_principal,
                    thread_id,
                    household,
                    context_payload,
                    &report,
                    trace,
                    trace_id,
                )
                .await;
            if result.tool == TOOL_SEARCH {
                if let Some(dispatched) = dispatched {
                    last_search_args = Some(dispatched);
                }
            }

            if let Some(output) = &result.output {
                if step.tool == TOOL_STORE || step.tool == TOOL_UPDATE_MEMORY_FIELDS {
                    if let Some(id) = output.get("id").and_then(Value::as_str) {
                        report.last_store_id = Some(id.to_string());
                    }
                }
            }

            let failed = result.error.is_some();
            report.results.push(result);

            if failed && step.mandatory {
                warn!(trace_id = %trace_id, tool = %step.tool, "mandatory step failed, aborting plan");
                break;
            }
        }

        self.verify(&mut report, understanding, last_search_args, trace_id)
            .await;
        report
    }

    /// Returns the step result plus, for dispatched calls, the final
    /// argument value (after references, scope, and embeddings) so the
    /// verification loop can broaden it later.
    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        step: &PlanStep,
        understanding: &Understanding,
        current_principal: Uuid,
        thread_id: Option<&str>,
        household: &HouseholdView,
        context_payload: &Map<String, Value>,
        report: &ExecutionReport,
        trace: &TraceCache,
        trace_id: Uuid,
    ) -> (StepResult, Option<Value>) {
        if !KNOWN_TOOLS.contains(&step.tool.as_str()) {
            return (
                StepResult::failed(
                    &step.tool,
                    "tool_planning",
                    format!("unknown tool '{}'", step.tool),
                    0,
                ),
                None,
            );
        }

        // 1. Cross-step references.
        let mut step_args = match args::resolve_references(
            &step.args,
            report.last_store_id.as_deref(),
            context_payload,
            &report.results,
        ) {
            Ok(resolved) => resolved,
            Err(err) => {
                return (
                    StepResult::failed(&step.tool, err.kind(), err.to_string(), 0),
                    None,
                );
            }
        };
        if step_args.is_null() {
            step_args = Value::Object(Map::new());
        }

        // 2. Scope injection. A personal scope that fails to resolve fails
        //    the step; the analysis phase should have asked for
        //    clarification before it got here.
        if SCOPED_TOOLS.contains(&step.tool.as_str()) {
            let target = match understanding.scope() {
                Some(scope) => {
                    match self.resolver.resolve(
                        scope,
                        understanding.person(),
                        current_principal,
                        thread_id,
                        household,
                    ) {
                        Ok(target) => target,
                        Err(err) => {
                            return (
                                StepResult::failed(
                                    &step.tool,
                                    "tool_planning",
                                    err.to_string(),
                                    0,
                                ),
                                None,
                            );
                        }
                    }
                }
                None => ScopeTarget {
                    user_ids: vec![current_principal],
                    thread_filter: None,
                },
            };
            args::inject_scope(&mut step_args, &target);
        }

        // 3. Soft-upsert rewrite for stores carrying an external id.
        let mut tool_name = step.tool.clone();
        if tool_name == TOOL_STORE {
            if let Some(rewritten) = self.soft_upsert_rewrite(&step_args, trace_id).await {
                tool_name = TOOL_UPDATE_MEMORY_FIELDS.to_string();
                step_args = rewritten;
            }
        }

        // 4. Embedding attachment.
        self.attach_embeddings(&tool_name, &mut step_args, trace).await;

        // 5. Dispatch under the per-tool budget.
        let result = self.dispatch(&tool_name, step_args.clone(), trace_id).await;
        (result, Some(step_args))
    }

    /// Probe for an existing `(user_id, external_id, type)` record; on a
    /// hit, return `update_memory_fields` arguments targeting it.
    async fn soft_upsert_rewrite(&self, store_args: &Value, trace_id: Uuid) -> Option<Value> {
        let ai_data = store_args.get("ai_data")?;
        let external_id = ai_data.get("external_id")?.as_str()?;

        let mut probe_filter = Map::new();
        probe_filter.insert("external_id".to_string(), Value::String(external_id.to_string()));
        if let Some(record_type) = ai_data.get("type") {
            probe_filter.insert("type".to_string(), record_type.clone());
        }
        let probe = json!({
            "user_id": store_args.get("user_id"),
            "filters": {"jsonb_equals": probe_filter, "limit": 1}
        });

        let result = self.dispatch(TOOL_SEARCH, probe, trace_id).await;
        let hit = result
            .output
            .as_ref()
            .and_then(|o| o.get("results"))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())?;
        let id = hit.get("id")?.as_str()?;

        info!(trace_id = %trace_id, external_id = %external_id, memory_id = %id, "soft upsert: rewriting store to update");
        Some(json!({"id": id, "fields": ai_data.clone()}))
    }

    async fn attach_embeddings(&self, tool_name: &str, step_args: &mut Value, trace: &TraceCache) {
        let Value::Object(map) = step_args else { return };
        match tool_name {
            TOOL_STORE => {
                if map.contains_key("embedding") {
                    return;
                }
                let Some(content) = map.get("content").and_then(Value::as_str) else {
                    return;
                };
                if let Some(vector) = self.embeddings.embed_one_lenient(trace, content).await {
                    map.insert("embedding".to_string(), json!(vector));
                }
            }
            TOOL_SEARCH => {
                if map.contains_key("query_embedding") {
                    return;
                }
                let Some(query) = map.get("query").and_then(Value::as_str) else {
                    return;
                };
                if query.is_empty() {
                    return;
                }
                if let Some(vector) = self.embeddings.embed_one_lenient(trace, query).await {
                    map.insert("query_embedding".to_string(), json!(vector));
                }
            }
            _ => {}
        }
    }

    async fn dispatch(&self, tool_name: &str, step_args: Value, trace_id: Uuid) -> StepResult {
        let budget = tool::time_budget(tool_name);
        let started = Instant::now();

        let outcome = tokio::time::timeout(budget, self.tools.call(tool_name, step_args)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Err(_) => {
                warn!(trace_id = %trace_id, tool = %tool_name, budget_ms = budget.as_millis() as u64, "step exceeded its budget");
                StepResult::failed(
                    tool_name,
                    "timeout",
                    format!("exceeded {}ms budget", budget.as_millis()),
                    elapsed_ms,
                )
            }
            Ok(Err(err)) => StepResult::failed(tool_name, err.kind(), err.to_string(), elapsed_ms),
            Ok(Ok(output)) => {
                // The tool service reports its own failures as an error
                // envelope with HTTP 200; capture those too.
                if let Some(envelope) = output.get("error") {
                    let kind = envelope
                        .get("kind")
                        .and_then(Value::as_str)
                        .unwrap_or("internal")
                        .to_string();
                    let message = envelope
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("tool error")
                        .to_string();
                    return StepResult::failed(tool_name, &kind, message, elapsed_ms);
                }
                debug!(trace_id = %trace_id, tool = %tool_name, elapsed_ms, "step completed");
                StepResult {
                    tool: tool_name.to_string(),
                    output: Some(output),
                    error: None,
                    elapsed_ms,
                }
            }
        }
    }

    /// Re-run an empty retrieval with progressively broader filters.
    ///
    /// Heuristic (deliberately parameterized, see DESIGN.md): only fires
    /// when the intent declared `need_action` and every `search` step of
    /// the plan came back empty. Refinement 1 drops `jsonb_equals` and
    /// `category`; refinement 2 additionally drops the type and date window
    /// and the vector, falling back to time-ordered retrieval.
    async fn verify(
        &self,
        report: &mut ExecutionReport,
        understanding: &Understanding,
        last_search_args: Option<Value>,
        trace_id: Uuid,
    ) {
        if !understanding.need_action || self.verify_max_refinements == 0 {
            return;
        }
        let searches: Vec<&StepResult> = report
            .results
            .iter()
            .filter(|r| r.tool == TOOL_SEARCH)
            .collect();
        if searches.is_empty() || !searches.iter().all(|r| is_empty_retrieval(r)) {
            return;
        }
        let Some(base) = last_search_args else { return };

        let mut refined = base;
        for round in 1..=self.verify_max_refinements {
            broaden_search_args(&mut refined, round);
            info!(trace_id = %trace_id, round, "verification: retrying retrieval with broader filters");
            let result = self.dispatch(TOOL_SEARCH, refined.clone(), trace_id).await;
            let empty = is_empty_retrieval(&result);
            report.results.push(result);
            report.verification_rounds = round;
            if !empty {
                break;
            }
        }
    }
}

fn is_empty_retrieval(result: &StepResult) -> bool {
    match &result.output {
        None => true,
        Some(output) => output
            .get("results")
            .and_then(Value::as_array)
            .map(|rows| rows.is_empty())
            .unwrap_or(false),
    }
}

/// Broaden search arguments for a verification round.
fn broaden_search_args(search_args: &mut Value, round: u8) {
    let Some(map) = search_args.as_object_mut() else { return };
    if let Some(Value::Object(filters)) = map.get_mut("filters") {
        filters.remove("jsonb_equals");
        filters.remove("category");
        if round >= 2 {
            filters.remove("type");
            filters.remove("date_from");
            filters.remove("date_to");
        }
    }
    if round >= 2 {
        // Fall back to trigram / time-ordered retrieval.
        map.remove("query_embedding");
    }
}
