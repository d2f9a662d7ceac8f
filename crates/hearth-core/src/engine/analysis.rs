//! The multi-round analysis loop.
//!
//! Each round sends the message plus the accumulated context to the LLM as
//! a JSON-shaped prompt and parses the reply into an [`Analysis`]. When the
//! model declares `needs_deeper_analysis` and asks for context, the
//! requests are resolved and the loop re-enters with the enriched payload.
//! The loop is a plain bounded `for`, never a coroutine; three rounds is
//! the ceiling.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use hearth_types::analysis::Analysis;
use hearth_types::error::EngineError;
use hearth_types::prompt::PromptPhase;
use hearth_types::tool::ToolSpec;

use crate::context::{BasicContext, ContextManager, RetrievalScope};
use crate::embedding::{Embedder, TraceCache};
use crate::household::HouseholdDirectory;
use crate::llm::{ChatOptions, LlmClient};
use crate::prompt::PromptAssembler;
use crate::tool::ToolClient;

/// Hard ceiling on thinking rounds.
pub const MAX_THINKING_ROUNDS: u8 = 3;

/// Outcome of the loop: the final analysis plus every context payload
/// gathered along the way (referenced later via `use_context`).
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub analysis: Analysis,
    pub context_payload: Map<String, Value>,
    pub rounds: u8,
}

pub struct AnalysisEngine<L, T, E, H> {
    llm: Arc<L>,
    context: Arc<ContextManager<T, E, H>>,
    prompts: Arc<PromptAssembler>,
}

impl<L, T, E, H> AnalysisEngine<L, T, E, H>
where
    L: LlmClient,
    T: ToolClient,
    E: Embedder,
    H: HouseholdDirectory,
{
    pub fn new(
        llm: Arc<L>,
        context: Arc<ContextManager<T, E, H>>,
        prompts: Arc<PromptAssembler>,
    ) -> Self {
        Self {
            llm,
            context,
            prompts,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn analyze(
        &self,
        content: &str,
        scope: RetrievalScope<'_>,
        basic: &BasicContext,
        request_meta: &Value,
        prompt_version: &str,
        specs: &[ToolSpec],
        trace: &TraceCache,
        trace_id: uuid::Uuid,
    ) -> Result<AnalysisOutcome, EngineError> {
        let system_prompt = self
            .prompts
            .assemble(prompt_version, PromptPhase::System, scope.channel, specs)
            .await;
        let understanding_prompt = self
            .prompts
            .assemble(prompt_version, PromptPhase::Understanding, scope.channel, specs)
            .await;
        let planning_prompt = self
            .prompts
            .assemble(prompt_version, PromptPhase::ToolPlanning, scope.channel, specs)
            .await;

        let mut accumulated: Map<String, Value> = Map::new();

        for round in 1..=MAX_THINKING_ROUNDS {
            let payload = self.build_payload(content, scope, basic, request_meta, &accumulated);
            let user_prompt = format!(
                "{understanding_prompt}\n\n{planning_prompt}\n\n输入数据：\n{}\n\n请严格按照契约输出 JSON。",
                serde_json::to_string(&payload).unwrap_or_default()
            );

            let raw = self
                .chat_json_with_retry(&system_prompt, &user_prompt, round)
                .await?;

            let mut analysis: Analysis =
                serde_json::from_value(raw.clone()).map_err(|e| EngineError::Analysis {
                    message: format!("analysis JSON does not match the contract: {e}"),
                    round,
                    raw_snippet: Some(snippet(&raw)),
                })?;
            analysis.understanding.thinking_depth = round;

            info!(
                trace_id = %trace_id,
                round,
                intent = analysis.understanding.intent.as_deref().unwrap_or(""),
                need_action = analysis.understanding.need_action,
                need_clarification = analysis.understanding.need_clarification,
                context_requests = analysis.context_requests.len(),
                plan_steps = analysis.tool_plan.steps.len(),
                "analysis round parsed"
            );

            let wants_more = analysis.understanding.needs_deeper_analysis
                && !analysis.context_requests.is_empty()
                && round < MAX_THINKING_ROUNDS;
            if !wants_more {
                return Ok(AnalysisOutcome {
                    analysis,
                    context_payload: accumulated,
                    rounds: round,
                });
            }

            // Only requests the model itself declared are executed.
            let resolved = self
                .context
                .resolve_requests(
                    &analysis.context_requests,
                    scope,
                    &basic.household,
                    trace,
                    trace_id,
                )
                .await?;
            for (name, value) in resolved {
                accumulated.insert(name, value);
            }
        }

        unreachable!("the loop returns on or before round {MAX_THINKING_ROUNDS}")
    }

    async fn chat_json_with_retry(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        round: u8,
    ) -> Result<Value, EngineError> {
        match self
            .llm
            .chat_json(system_prompt, user_prompt, ChatOptions::planning())
            .await
        {
            Ok(value) => Ok(value),
            Err(err) if err.is_retryable() => {
                warn!(round, error = %err, "analysis call failed at transport level, retrying once");
                self.llm
                    .chat_json(system_prompt, user_prompt, ChatOptions::planning())
                    .await
                    .map_err(|e| EngineError::Analysis {
                        message: format!("llm failed after retry: {e}"),
                        round,
                        raw_snippet: None,
                    })
            }
            Err(err) => Err(EngineError::Analysis {
                message: err.to_string(),
                round,
                raw_snippet: None,
            }),
        }
    }

    fn build_payload(
        &self,
        content: &str,
        scope: RetrievalScope<'_>,
        basic: &BasicContext,
        request_meta: &Value,
        accumulated: &Map<String, Value>,
    ) -> Value {
        let household_summary: Vec<Value> = basic
            .household
            .members
            .iter()
            .map(|m| {
                json!({
                    "member_key": m.member_key,
                    "display_name": m.display_name,
                    "role": m.role,
                    "user_ids_count": m.user_ids.len(),
                })
            })
            .collect();

        let mut context = json!({
            "light_context": basic.light_context,
            "household": {
                "members": household_summary,
                "family_scope_user_ids": basic.household.family_scope_user_ids,
            },
            "request_meta": request_meta,
        });
        if let Some(summary) = &basic.thread_summary {
            context["thread_summary"] = summary.clone();
        }
        if !accumulated.is_empty() {
            context["accumulated_context"] = Value::Object(accumulated.clone());
        }

        json!({
            "message": content,
            "user": {
                "principal": scope.principal.to_string(),
                "channel": scope.channel,
                "thread_id": scope.thread_id,
            },
            "context": context,
        })
    }
}

fn snippet(raw: &Value) -> String {
    let text = raw.to_string();
    text.chars().take(200).collect()
}
