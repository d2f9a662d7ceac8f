//! Final reply generation and the clarification branch.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::warn;

use hearth_types::analysis::Analysis;
use hearth_types::error::EngineError;
use hearth_types::prompt::PromptPhase;
use hearth_types::tool::ToolSpec;

use crate::executor::ExecutionReport;
use crate::llm::{ChatOptions, LlmClient};
use crate::prompt::PromptAssembler;

/// Appended when a reply is truncated at the channel cap.
const ELLIPSIS: &str = "…";

pub struct Responder<L> {
    llm: Arc<L>,
    prompts: Arc<PromptAssembler>,
}

impl<L: LlmClient> Responder<L> {
    pub fn new(llm: Arc<L>, prompts: Arc<PromptAssembler>) -> Self {
        Self { llm, prompts }
    }

    /// Generate the final reply: echoed understanding + execution result +
    /// grounding context, through the variant's response blocks.
    pub async fn respond(
        &self,
        analysis: &Analysis,
        report: &ExecutionReport,
        context_payload: &Map<String, Value>,
        prompt_version: &str,
        channel: Option<&str>,
        specs: &[ToolSpec],
    ) -> Result<String, EngineError> {
        let system_prompt = self
            .prompts
            .assemble(prompt_version, PromptPhase::Response, channel, specs)
            .await;

        let payload = json!({
            "understanding": analysis.understanding,
            "execution_result": report,
            "context_payload": context_payload,
            "response_directives": analysis.response_directives,
        });
        let user_prompt = format!(
            "输入：\n{}\n\n请生成给用户的最终回复文本。",
            serde_json::to_string(&payload).unwrap_or_default()
        );

        let reply = self
            .llm
            .chat_text(&system_prompt, &user_prompt, ChatOptions::response())
            .await?;

        Ok(self.truncate_for_channel(reply.trim().to_string(), prompt_version, channel))
    }

    /// Generate a clarification question for the channel. Falls back to
    /// the analysis' own suggestions when the LLM call fails.
    pub async fn clarify(
        &self,
        analysis: &Analysis,
        prompt_version: &str,
        channel: Option<&str>,
        specs: &[ToolSpec],
    ) -> String {
        let understanding = &analysis.understanding;
        let system_prompt = self
            .prompts
            .assemble(prompt_version, PromptPhase::Response, channel, specs)
            .await;
        let payload = json!({
            "need_clarification": true,
            "missing_fields": understanding.missing_fields,
            "clarification_questions": understanding.clarification_questions,
            "intent": understanding.intent,
        });
        let user_prompt = format!(
            "用户消息缺少关键信息。请基于以下内容向用户提出一个自然的澄清问题：\n{}",
            serde_json::to_string(&payload).unwrap_or_default()
        );

        match self
            .llm
            .chat_text(&system_prompt, &user_prompt, ChatOptions::response())
            .await
        {
            Ok(reply) if !reply.trim().is_empty() => {
                self.truncate_for_channel(reply.trim().to_string(), prompt_version, channel)
            }
            Ok(_) | Err(_) => {
                warn!("clarification call failed, falling back to analysis suggestions");
                understanding
                    .suggested_reply
                    .clone()
                    .or_else(|| understanding.clarification_questions.first().cloned())
                    .unwrap_or_else(|| "能再补充一些细节吗？".to_string())
            }
        }
    }

    fn truncate_for_channel(
        &self,
        reply: String,
        prompt_version: &str,
        channel: Option<&str>,
    ) -> String {
        match self.prompts.reply_cap(prompt_version, channel) {
            Some(cap) if reply.chars().count() > cap => {
                let truncated: String = reply.chars().take(cap.saturating_sub(1)).collect();
                format!("{truncated}{ELLIPSIS}")
            }
            _ => reply,
        }
    }
}
