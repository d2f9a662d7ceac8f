//! Top-level per-message flow.
//!
//! `process` never returns an error to the caller: every failure is logged
//! with the trace id and converted into a user-friendly reply selected by
//! error kind.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use hearth_types::analysis::Analysis;
use hearth_types::error::EngineError;
use hearth_types::experiment::ExperimentResult;
use hearth_types::message::MessageContext;
use hearth_types::tool::{TOOL_BATCH_STORE, TOOL_STORE, ToolSpec};

use crate::context::{BasicContext, ContextManager, RetrievalScope};
use crate::embedding::{Embedder, EmbeddingService, TraceCache};
use crate::engine::analysis::AnalysisEngine;
use crate::engine::responder::Responder;
use crate::engine::{build_request_meta, merge_attachment_texts};
use crate::executor::ToolExecutor;
use crate::experiment::ExperimentEngine;
use crate::household::HouseholdDirectory;
use crate::llm::{ChatOptions, LlmClient};
use crate::tool::ToolClient;

/// What one message produced, for experiment accounting.
struct ProcessOutcome {
    reply: String,
    need_clarification: bool,
    tool_calls: u32,
}

pub struct Orchestrator<L, T, E, H> {
    analysis: AnalysisEngine<L, T, E, H>,
    executor: ToolExecutor<T, E>,
    responder: Responder<L>,
    context: Arc<ContextManager<T, E, H>>,
    tools: Arc<T>,
    embeddings: Arc<EmbeddingService<E>>,
    experiments: Arc<ExperimentEngine>,
    llm: Arc<L>,
    default_timezone: String,
    summary_turn_threshold: u32,
    /// Turns seen per thread since the last summary (process-local).
    thread_turns: DashMap<String, u32>,
}

impl<L, T, E, H> Orchestrator<L, T, E, H>
where
    L: LlmClient,
    T: ToolClient,
    E: Embedder,
    H: HouseholdDirectory,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        analysis: AnalysisEngine<L, T, E, H>,
        executor: ToolExecutor<T, E>,
        responder: Responder<L>,
        context: Arc<ContextManager<T, E, H>>,
        tools: Arc<T>,
        embeddings: Arc<EmbeddingService<E>>,
        experiments: Arc<ExperimentEngine>,
        llm: Arc<L>,
        default_timezone: String,
        summary_turn_threshold: u32,
    ) -> Self {
        Self {
            analysis,
            executor,
            responder,
            context,
            tools,
            embeddings,
            experiments,
            llm,
            default_timezone,
            summary_turn_threshold: summary_turn_threshold.max(1),
            thread_turns: DashMap::new(),
        }
    }

    /// Handle one inbound message end to end.
    pub async fn process(&self, content: &str, principal: Uuid, ctx: &MessageContext) -> String {
        let started = Instant::now();
        let trace = TraceCache::new();

        info!(
            trace_id = %ctx.trace_id,
            user_id = %principal,
            channel = ctx.channel.as_deref().unwrap_or("-"),
            thread_id = ctx.thread_id.as_deref().unwrap_or("-"),
            preview = %content.chars().take(50).collect::<String>(),
            attachments = ctx.attachments.len(),
            "message.received"
        );

        let assignment = self.experiments.assign(principal, ctx.channel.as_deref());
        info!(
            trace_id = %ctx.trace_id,
            variant = %assignment.variant,
            prompt_version = %assignment.prompt_version,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "step.variant.completed"
        );

        let outcome = self
            .run(content, principal, ctx, &assignment.prompt_version, &trace, started)
            .await;

        match outcome {
            Ok(outcome) => {
                info!(
                    trace_id = %ctx.trace_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    reply_length = outcome.reply.chars().count(),
                    "message.process.completed"
                );
                self.record_experiment(&assignment, principal, ctx, started, Some(&outcome), None);
                outcome.reply
            }
            Err(err) => {
                error!(
                    trace_id = %ctx.trace_id,
                    user_id = %principal,
                    kind = err.kind(),
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "message.process.error"
                );
                self.record_experiment(&assignment, principal, ctx, started, None, Some(&err));
                err.user_friendly_message().to_string()
            }
        }
    }

    async fn run(
        &self,
        content: &str,
        principal: Uuid,
        ctx: &MessageContext,
        prompt_version: &str,
        trace: &TraceCache,
        started: Instant,
    ) -> Result<ProcessOutcome, EngineError> {
        // 1. Preprocess: fold derived attachment text into the message.
        let processed = merge_attachment_texts(content, &ctx.attachments);
        info!(
            trace_id = %ctx.trace_id,
            original_length = content.chars().count(),
            processed_length = processed.chars().count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "step.preprocess.completed"
        );

        let specs = match self.tools.specs().await {
            Ok(specs) => specs,
            Err(err) => {
                warn!(trace_id = %ctx.trace_id, error = %err, "tool specs unavailable");
                Vec::new()
            }
        };

        let scope = RetrievalScope {
            principal,
            thread_id: ctx.thread_id.as_deref(),
            shared_thread: ctx.shared_thread,
            channel: ctx.channel.as_deref(),
        };
        let basic = self.context.basic_context(scope, ctx.trace_id).await;

        let tz_name = ctx
            .timezone
            .as_deref()
            .or_else(|| basic.household.timezone())
            .unwrap_or(&self.default_timezone)
            .to_string();
        let request_meta =
            build_request_meta(chrono::Utc::now(), &tz_name, ctx, principal, prompt_version);

        // 2. Analyze. An empty message skips the LLM; the contract says it
        //    always needs clarification.
        let (analysis, context_payload) = if processed.trim().is_empty() {
            (empty_message_analysis(), Map::new())
        } else {
            let outcome = self
                .analysis
                .analyze(
                    &processed,
                    scope,
                    &basic,
                    &request_meta,
                    prompt_version,
                    &specs,
                    trace,
                    ctx.trace_id,
                )
                .await?;
            (outcome.analysis, outcome.context_payload)
        };
        info!(
            trace_id = %ctx.trace_id,
            thinking_depth = analysis.understanding.thinking_depth,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "step.analyze.completed"
        );

        // 3. Clarification branch: one templated reply, one lightweight
        //    memory, done.
        if analysis.understanding.need_clarification {
            let reply = self
                .responder
                .clarify(&analysis, prompt_version, ctx.channel.as_deref(), &specs)
                .await;
            self.persist_clarification_turn(&processed, &reply, principal, ctx, trace)
                .await;
            info!(
                trace_id = %ctx.trace_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "step.clarify.completed"
            );
            return Ok(ProcessOutcome {
                reply,
                need_clarification: true,
                tool_calls: 0,
            });
        }

        // 4. Execute the plan.
        let report = self
            .executor
            .execute(
                &analysis.tool_plan,
                &analysis.understanding,
                principal,
                ctx.thread_id.as_deref(),
                &basic.household,
                &context_payload,
                trace,
                ctx.trace_id,
            )
            .await;
        info!(
            trace_id = %ctx.trace_id,
            steps = report.results.len(),
            errors = report.results.iter().filter(|r| r.error.is_some()).count(),
            verification_rounds = report.verification_rounds,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "step.execute.completed"
        );

        // 5. Respond.
        let reply = self
            .responder
            .respond(
                &analysis,
                &report,
                &context_payload,
                prompt_version,
                ctx.channel.as_deref(),
                &specs,
            )
            .await?;
        info!(
            trace_id = %ctx.trace_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "step.respond.completed"
        );

        // 6. Persist the chat-turn pair with the echoed understanding.
        let tool_calls = report.results.len() as u32;
        self.persist_chat_turns(&processed, &reply, &analysis, principal, ctx, trace)
            .await;
        info!(
            trace_id = %ctx.trace_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "step.persist.completed"
        );

        // 7. Opportunistic thread summary.
        self.maybe_summarize(&processed, &reply, &basic, principal, ctx, trace)
            .await;

        Ok(ProcessOutcome {
            reply,
            need_clarification: false,
            tool_calls,
        })
    }

    // ------------------------------------------------------------------
    // Persistence side effects (all through the tool service)
    // ------------------------------------------------------------------

    fn common_turn_fields(&self, analysis: &Analysis, ctx: &MessageContext) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("type".to_string(), json!("chat_turn"));
        if let Some(thread_id) = &ctx.thread_id {
            fields.insert("thread_id".to_string(), json!(thread_id));
        }
        if let Some(channel) = &ctx.channel {
            fields.insert("channel".to_string(), json!(channel));
        }
        fields.insert("trace_id".to_string(), json!(ctx.trace_id.to_string()));
        if let Some(intent) = &analysis.understanding.intent {
            fields.insert("intent".to_string(), json!(intent));
        }
        for (key, value) in &analysis.understanding.entities {
            fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
        fields
    }

    async fn persist_chat_turns(
        &self,
        user_message: &str,
        assistant_message: &str,
        analysis: &Analysis,
        principal: Uuid,
        ctx: &MessageContext,
        trace: &TraceCache,
    ) {
        let common = self.common_turn_fields(analysis, ctx);

        let mut user_ai = common.clone();
        user_ai.insert("role".to_string(), json!("user"));
        let mut assistant_ai = common;
        assistant_ai.insert("role".to_string(), json!("assistant"));

        let user_embedding = self.embeddings.embed_one_lenient(trace, user_message).await;
        let assistant_embedding = self
            .embeddings
            .embed_one_lenient(trace, assistant_message)
            .await;

        let batch_args = json!({
            "memories": [
                {
                    "user_id": principal.to_string(),
                    "content": user_message,
                    "ai_data": user_ai,
                    "embedding": user_embedding,
                },
                {
                    "user_id": principal.to_string(),
                    "content": assistant_message,
                    "ai_data": assistant_ai,
                    "embedding": assistant_embedding,
                },
            ]
        });

        if let Err(err) = self.tools.call(TOOL_BATCH_STORE, batch_args).await {
            // Losing a turn is not fatal for the reply; the next poll of
            // the thread simply sees a gap.
            warn!(trace_id = %ctx.trace_id, error = %err, "chat turn persistence failed");
        }
    }

    async fn persist_clarification_turn(
        &self,
        user_message: &str,
        question: &str,
        principal: Uuid,
        ctx: &MessageContext,
        trace: &TraceCache,
    ) {
        let mut ai_data = Map::new();
        ai_data.insert("type".to_string(), json!("clarification_turn"));
        if let Some(thread_id) = &ctx.thread_id {
            ai_data.insert("thread_id".to_string(), json!(thread_id));
        }
        if let Some(channel) = &ctx.channel {
            ai_data.insert("channel".to_string(), json!(channel));
        }
        ai_data.insert("trace_id".to_string(), json!(ctx.trace_id.to_string()));
        ai_data.insert("question".to_string(), json!(question));

        let embedding = self.embeddings.embed_one_lenient(trace, user_message).await;
        let store_args = json!({
            "user_id": principal.to_string(),
            "content": user_message,
            "ai_data": ai_data,
            "embedding": embedding,
        });
        if let Err(err) = self.tools.call(TOOL_STORE, store_args).await {
            warn!(trace_id = %ctx.trace_id, error = %err, "clarification turn persistence failed");
        }
    }

    /// Write a `thread_summary` memory once a thread has accumulated
    /// enough turns since the last summary. The cadence counter is
    /// process-local; the stored summary itself is keyed by
    /// `external_id = thread_summary:<thread_id>` so repeated writes
    /// collapse into one record.
    async fn maybe_summarize(
        &self,
        user_message: &str,
        assistant_message: &str,
        basic: &BasicContext,
        principal: Uuid,
        ctx: &MessageContext,
        trace: &TraceCache,
    ) {
        let Some(thread_id) = ctx.thread_id.as_deref() else { return };

        let due = {
            let mut turns = self.thread_turns.entry(thread_id.to_string()).or_insert(0);
            *turns += 1;
            if *turns >= self.summary_turn_threshold {
                *turns = 0;
                true
            } else {
                false
            }
        };
        if !due {
            return;
        }

        let mut transcript = String::new();
        for memory in &basic.light_context {
            if let Some(text) = memory.get("content").and_then(Value::as_str) {
                transcript.push_str(text);
                transcript.push('\n');
            }
        }
        transcript.push_str(user_message);
        transcript.push('\n');
        transcript.push_str(assistant_message);

        let summary = match self
            .llm
            .chat_text(
                "用两三句话总结这段家庭对话的当前关注点，供后续对话参考。只输出总结本身。",
                &transcript,
                ChatOptions::default(),
            )
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            Ok(_) => return,
            Err(err) => {
                warn!(trace_id = %ctx.trace_id, error = %err, "thread summary call failed");
                return;
            }
        };

        let embedding = self.embeddings.embed_one_lenient(trace, &summary).await;
        let store_args = json!({
            "user_id": principal.to_string(),
            "content": summary,
            "ai_data": {
                "type": "thread_summary",
                "thread_id": thread_id,
                "external_id": format!("thread_summary:{thread_id}"),
                "channel": ctx.channel,
            },
            "embedding": embedding,
        });
        match self.tools.call(TOOL_STORE, store_args).await {
            Ok(_) => info!(trace_id = %ctx.trace_id, thread_id, "step.summarize.completed"),
            Err(err) => warn!(trace_id = %ctx.trace_id, error = %err, "thread summary persistence failed"),
        }
    }

    fn record_experiment(
        &self,
        assignment: &crate::experiment::Assignment,
        principal: Uuid,
        ctx: &MessageContext,
        started: Instant,
        outcome: Option<&ProcessOutcome>,
        error: Option<&EngineError>,
    ) {
        let Some(experiment_id) = &assignment.experiment_id else { return };
        self.experiments.record(&ExperimentResult {
            user_id: principal,
            experiment_id: experiment_id.clone(),
            variant: assignment.variant.clone(),
            trace_id: ctx.trace_id,
            channel: ctx.channel.clone(),
            response_time_ms: started.elapsed().as_millis() as u64,
            success: error.is_none(),
            error_kind: error.map(|e| e.kind().to_string()),
            need_clarification: outcome.map(|o| o.need_clarification).unwrap_or(false),
            tool_calls_count: outcome.map(|o| o.tool_calls).unwrap_or(0),
            response_length: outcome.map(|o| o.reply.chars().count() as u32).unwrap_or(0),
        });
    }
}

/// Analysis record for an empty message: always a clarification.
fn empty_message_analysis() -> Analysis {
    let mut analysis = Analysis::default();
    analysis.understanding.need_clarification = true;
    analysis.understanding.thinking_depth = 1;
    analysis
        .understanding
        .clarification_questions
        .push("你想告诉我什么呢？".to_string());
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingService;
    use crate::prompt::PromptAssembler;
    use crate::prompt::catalog::default_catalog;
    use crate::scope::ScopeResolver;
    use hearth_types::household::HouseholdView;
    use hearth_types::message::Attachment;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Mutex;

    // ------------------------------------------------------------------
    // Doubles
    // ------------------------------------------------------------------

    struct ScriptedLlm {
        json_responses: Mutex<VecDeque<Result<Value, EngineError>>>,
        text_responses: Mutex<VecDeque<Result<String, EngineError>>>,
        json_calls: Mutex<u32>,
    }

    impl ScriptedLlm {
        fn new(json_responses: Vec<Result<Value, EngineError>>, text_responses: Vec<Result<String, EngineError>>) -> Self {
            Self {
                json_responses: Mutex::new(json_responses.into()),
                text_responses: Mutex::new(text_responses.into()),
                json_calls: Mutex::new(0),
            }
        }
    }

    impl LlmClient for ScriptedLlm {
        async fn chat_text(
            &self,
            _system: &str,
            _user: &str,
            _opts: ChatOptions,
        ) -> Result<String, EngineError> {
            self.text_responses
                .lock()
                .await
                .pop_front()
                .unwrap_or(Ok("好的。".to_string()))
        }

        async fn chat_json(
            &self,
            _system: &str,
            _user: &str,
            _opts: ChatOptions,
        ) -> Result<Value, EngineError> {
            *self.json_calls.lock().await += 1;
            self.json_responses.lock().await.pop_front().unwrap_or(Ok(json!({})))
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
            Ok(texts.iter().map(|_| vec![0.0]).collect())
        }
    }

    struct RecordingTools {
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingTools {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }

        async fn calls_of(&self, tool: &str) -> Vec<Value> {
            self.calls
                .lock()
                .await
                .iter()
                .filter(|(name, _)| name == tool)
                .map(|(_, call_args)| call_args.clone())
                .collect()
        }
    }

    impl ToolClient for RecordingTools {
        async fn call(&self, tool: &str, call_args: Value) -> Result<Value, EngineError> {
            self.calls.lock().await.push((tool.to_string(), call_args));
            Ok(match tool {
                "search" => json!({"results": [], "total": 0}),
                "store" => json!({"success": true, "id": Uuid::now_v7().to_string()}),
                "batch_store" => json!({"success": true, "ids": []}),
                _ => json!({"success": true}),
            })
        }

        async fn specs(&self) -> Result<Vec<ToolSpec>, EngineError> {
            Ok(vec![])
        }
    }

    struct StubEmbedder;

    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
            Ok(texts.iter().map(|_| vec![0.3, 0.7]).collect())
        }

        fn model_name(&self) -> &str {
            "stub"
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    struct StubHousehold;

    impl HouseholdDirectory for StubHousehold {
        async fn view(&self) -> Result<HouseholdView, EngineError> {
            Ok(HouseholdView::default())
        }
    }

    type TestOrchestrator = Orchestrator<ScriptedLlm, RecordingTools, StubEmbedder, StubHousehold>;

    fn orchestrator(llm: ScriptedLlm, summary_threshold: u32) -> (Arc<RecordingTools>, TestOrchestrator) {
        let llm = Arc::new(llm);
        let tools = Arc::new(RecordingTools::new());
        let embeddings = Arc::new(EmbeddingService::new(
            Arc::new(StubEmbedder),
            64,
            Duration::from_secs(60),
        ));
        let prompts = Arc::new(PromptAssembler::new(default_catalog(), Duration::from_secs(60)));
        let context = Arc::new(ContextManager::new(
            Arc::clone(&tools),
            Arc::clone(&embeddings),
            Arc::new(StubHousehold),
            ScopeResolver::new(vec![]),
        ));
        let analysis = AnalysisEngine::new(Arc::clone(&llm), Arc::clone(&context), Arc::clone(&prompts));
        let executor = ToolExecutor::new(
            Arc::clone(&tools),
            Arc::clone(&embeddings),
            ScopeResolver::new(vec![]),
            0,
        );
        let responder = Responder::new(Arc::clone(&llm), prompts);
        let experiments = Arc::new(ExperimentEngine::new(vec![], "v5_unified".to_string()));

        let orch = Orchestrator::new(
            analysis,
            executor,
            responder,
            context,
            Arc::clone(&tools),
            embeddings,
            experiments,
            llm,
            "Asia/Shanghai".to_string(),
            summary_threshold,
        );
        (tools, orch)
    }

    fn message_ctx(thread: Option<&str>) -> MessageContext {
        MessageContext {
            trace_id: Uuid::new_v4(),
            channel: Some("threema".to_string()),
            thread_id: thread.map(str::to_string),
            shared_thread: false,
            attachments: vec![],
            timezone: None,
        }
    }

    fn expense_analysis() -> Value {
        json!({
            "understanding": {
                "intent": "record expense",
                "entities": {"type": "expense", "amount": 80},
                "need_action": true
            },
            "tool_plan": {
                "steps": [{"tool": "store", "args": {"content": "今天买菜花了80元", "ai_data": {"type": "expense", "amount": 80, "occurred_at": "2025-10-17T00:00:00+08:00"}}}]
            }
        })
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_expense_flow_stores_memory_and_chat_turns() {
        let llm = ScriptedLlm::new(
            vec![Ok(expense_analysis())],
            vec![Ok("已记录：买菜 80 元。".to_string())],
        );
        let (tools, orch) = orchestrator(llm, 100);

        let reply = orch
            .process("今天买菜花了80元", Uuid::now_v7(), &message_ctx(Some("t-1")))
            .await;
        assert!(reply.contains("80"));

        let stores = tools.calls_of("store").await;
        assert_eq!(stores.len(), 1, "exactly one expense memory");
        assert_eq!(stores[0]["ai_data"]["type"], "expense");
        assert!(stores[0]["embedding"].is_array(), "store carries an embedding");

        let batches = tools.calls_of("batch_store").await;
        assert_eq!(batches.len(), 1, "exactly one chat-turn pair");
        let memories = batches[0]["memories"].as_array().unwrap();
        assert_eq!(memories.len(), 2);
        assert_eq!(memories[0]["ai_data"]["role"], "user");
        assert_eq!(memories[0]["ai_data"]["type"], "chat_turn");
        assert_eq!(memories[0]["ai_data"]["amount"], 80);
        assert_eq!(memories[1]["ai_data"]["role"], "assistant");
    }

    #[tokio::test]
    async fn test_clarification_branch_stores_single_turn() {
        let llm = ScriptedLlm::new(
            vec![Ok(json!({
                "understanding": {
                    "intent": "record expense",
                    "need_clarification": true,
                    "missing_fields": ["category"],
                    "clarification_questions": ["这100元花在什么上面？"]
                }
            }))],
            vec![Ok("这100元花在什么上面？".to_string())],
        );
        let (tools, orch) = orchestrator(llm, 100);

        let reply = orch
            .process("记账，花了100元", Uuid::now_v7(), &message_ctx(Some("t-1")))
            .await;
        assert!(reply.contains("100"));

        let stores = tools.calls_of("store").await;
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0]["ai_data"]["type"], "clarification_turn");
        assert!(tools.calls_of("batch_store").await.is_empty(), "no chat-turn pair on clarification");
    }

    #[tokio::test]
    async fn test_empty_message_clarifies_without_llm_analysis() {
        let llm = ScriptedLlm::new(vec![], vec![Ok("你想告诉我什么呢？".to_string())]);
        let (tools, orch) = orchestrator(llm, 100);

        let reply = orch.process("   ", Uuid::now_v7(), &message_ctx(None)).await;
        assert!(!reply.is_empty());

        // No analysis call happened; only the clarification turn store.
        let stores = tools.calls_of("store").await;
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0]["ai_data"]["type"], "clarification_turn");
    }

    #[tokio::test]
    async fn test_analysis_failure_yields_friendly_reply() {
        let llm = ScriptedLlm::new(
            vec![Err(EngineError::Llm {
                message: "bad key".to_string(),
                retryable: false,
            })],
            vec![],
        );
        let (tools, orch) = orchestrator(llm, 100);

        let reply = orch
            .process("本月预算是多少？", Uuid::now_v7(), &message_ctx(Some("t-1")))
            .await;
        assert!(reply.contains("抱歉") || reply.contains("请"));
        assert!(tools.calls_of("batch_store").await.is_empty());
    }

    #[tokio::test]
    async fn test_tool_errors_still_produce_reply_and_persist_turn() {
        struct FailingSearchTools {
            inner: RecordingTools,
        }

        impl ToolClient for FailingSearchTools {
            async fn call(&self, tool: &str, call_args: Value) -> Result<Value, EngineError> {
                self.inner.calls.lock().await.push((tool.to_string(), call_args));
                if tool == "search" {
                    return Ok(json!({"error": {"kind": "timeout", "message": "search timed out"}}));
                }
                Ok(json!({"success": true, "ids": []}))
            }

            async fn specs(&self) -> Result<Vec<ToolSpec>, EngineError> {
                Ok(vec![])
            }
        }

        let llm = Arc::new(ScriptedLlm::new(
            vec![Ok(json!({
                "understanding": {"intent": "query", "need_action": true},
                "tool_plan": {"steps": [{"tool": "search", "args": {"query": "预算"}}]}
            }))],
            vec![Ok("检索超时了，稍后我再帮你查。".to_string())],
        ));
        let tools = Arc::new(FailingSearchTools {
            inner: RecordingTools::new(),
        });
        let embeddings = Arc::new(EmbeddingService::new(
            Arc::new(StubEmbedder),
            64,
            Duration::from_secs(60),
        ));
        let prompts = Arc::new(PromptAssembler::new(default_catalog(), Duration::from_secs(60)));
        let context = Arc::new(ContextManager::new(
            Arc::clone(&tools),
            Arc::clone(&embeddings),
            Arc::new(StubHousehold),
            ScopeResolver::new(vec![]),
        ));
        let orch = Orchestrator::new(
            AnalysisEngine::new(Arc::clone(&llm), Arc::clone(&context), Arc::clone(&prompts)),
            ToolExecutor::new(Arc::clone(&tools), Arc::clone(&embeddings), ScopeResolver::new(vec![]), 0),
            Responder::new(Arc::clone(&llm), prompts),
            context,
            Arc::clone(&tools),
            embeddings,
            Arc::new(ExperimentEngine::new(vec![], "v5_unified".to_string())),
            llm,
            "Asia/Shanghai".to_string(),
            100,
        );

        let reply = orch
            .process("查一下预算", Uuid::now_v7(), &message_ctx(Some("t-1")))
            .await;
        assert!(reply.contains("超时"));

        let batches = tools.inner.calls_of("batch_store").await;
        assert_eq!(batches.len(), 1, "assistant turn persisted despite tool error");
    }

    #[tokio::test]
    async fn test_attachment_text_reaches_analysis_payload() {
        let llm = ScriptedLlm::new(
            vec![Ok(json!({"understanding": {"intent": "note"}}))],
            vec![Ok("收到。".to_string())],
        );
        let (tools, orch) = orchestrator(llm, 100);

        let mut ctx = message_ctx(Some("t-1"));
        ctx.attachments.push(Attachment {
            kind: Some("image".to_string()),
            transcription: None,
            ocr_text: Some("小票 80 元".to_string()),
            vision_summary: None,
        });
        orch.process("看看这个", Uuid::now_v7(), &ctx).await;

        // The persisted user turn carries the merged content.
        let batches = tools.calls_of("batch_store").await;
        let user_content = batches[0]["memories"][0]["content"].as_str().unwrap();
        assert!(user_content.contains("看看这个"));
        assert!(user_content.contains("小票 80 元"));
    }

    #[tokio::test]
    async fn test_thread_summary_written_at_threshold() {
        let llm = ScriptedLlm::new(
            vec![
                Ok(json!({"understanding": {"intent": "chat"}})),
                Ok(json!({"understanding": {"intent": "chat"}})),
            ],
            vec![
                Ok("好的。".to_string()),
                Ok("好的。".to_string()),
                Ok("一家人在讨论十月的买菜开销。".to_string()),
            ],
        );
        let (tools, orch) = orchestrator(llm, 2);
        let principal = Uuid::now_v7();

        orch.process("第一句", principal, &message_ctx(Some("t-9"))).await;
        orch.process("第二句", principal, &message_ctx(Some("t-9"))).await;

        let stores = tools.calls_of("store").await;
        let summaries: Vec<&Value> = stores
            .iter()
            .filter(|s| s["ai_data"]["type"] == "thread_summary")
            .collect();
        assert_eq!(summaries.len(), 1);
        assert_eq!(
            summaries[0]["ai_data"]["external_id"],
            "thread_summary:t-9"
        );
    }
}
