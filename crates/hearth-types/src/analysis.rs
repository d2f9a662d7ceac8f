//! The `Analysis` record produced by the analysis engine.
//!
//! The LLM returns this as JSON; deserialization is deliberately lenient
//! (every field has a default) so that a partially-filled answer still
//! parses. Schema-level checks that go beyond shape (plan length, thinking
//! depth) live in `hearth-core::engine::analysis`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scope::Scope;

/// Structured understanding of one user utterance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Understanding {
    /// Free-text intent description.
    #[serde(default)]
    pub intent: Option<String>,

    /// Open entity bag. Conventional keys: `scope`, `person`, `person_key`,
    /// `amount`, `occurred_at`, `type`, `category`.
    #[serde(default)]
    pub entities: serde_json::Map<String, Value>,

    #[serde(default)]
    pub need_action: bool,

    #[serde(default)]
    pub need_clarification: bool,

    #[serde(default)]
    pub missing_fields: Vec<String>,

    #[serde(default)]
    pub clarification_questions: Vec<String>,

    #[serde(default)]
    pub suggested_reply: Option<String>,

    #[serde(default)]
    pub thinking_depth: u8,

    #[serde(default)]
    pub needs_deeper_analysis: bool,

    #[serde(default)]
    pub analysis_reasoning: Option<String>,

    #[serde(default)]
    pub next_exploration_areas: Vec<String>,
}

impl Understanding {
    /// Declared scope, when the entities carry one.
    pub fn scope(&self) -> Option<Scope> {
        self.entities
            .get("scope")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    /// Person identifier from `person_key` (preferred) or `person`.
    pub fn person(&self) -> Option<&str> {
        self.entities
            .get("person_key")
            .or_else(|| self.entities.get("person"))
            .and_then(|v| v.as_str())
    }
}

/// What kind of context the LLM asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRequestKind {
    RecentMemories,
    SemanticSearch,
    DirectSearch,
    ThreadSummaries,
}

/// One declarative request for additional grounding data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRequest {
    pub name: String,
    pub kind: ContextRequestKind,

    #[serde(default)]
    pub query: Option<String>,

    #[serde(default)]
    pub limit: Option<u32>,

    #[serde(default)]
    pub filters: Option<Value>,

    #[serde(default)]
    pub scope: Option<Scope>,

    #[serde(default)]
    pub person_key: Option<String>,
}

/// One tool invocation inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool: String,

    #[serde(default)]
    pub args: Value,

    /// A mandatory step aborts the rest of the plan on failure.
    #[serde(default)]
    pub mandatory: bool,
}

/// Ordered list of tool invocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPlan {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

/// Hints for the responder: channel profile, voice, focus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseDirectives {
    #[serde(default)]
    pub profile: Option<String>,

    #[serde(default)]
    pub voice: Option<String>,

    #[serde(default)]
    pub focus: Option<String>,
}

/// Full analysis record for one message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default)]
    pub understanding: Understanding,

    #[serde(default)]
    pub context_requests: Vec<ContextRequest>,

    #[serde(default)]
    pub tool_plan: ToolPlan,

    #[serde(default)]
    pub response_directives: ResponseDirectives,
}
