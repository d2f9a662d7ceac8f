use thiserror::Error;

/// Engine-level error taxonomy.
///
/// Every variant carries enough context for the orchestrator to log a
/// structured `message.process.error` event and map the failure to a
/// user-friendly reply. Tool errors inside a plan are *captured* into the
/// execution result, never propagated; only analysis and context failures
/// abort a round.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed LLM JSON, schema violation, or LLM HTTP error after retry.
    #[error("analysis failed (round {round}): {message}")]
    Analysis {
        message: String,
        round: u8,
        raw_snippet: Option<String>,
    },

    /// A declared context request could not be resolved.
    #[error("context resolution failed for '{name}': {message}")]
    ContextResolution { name: String, message: String },

    /// A step references an undefined tool, an unresolved cross-step
    /// reference, or an unresolvable person.
    #[error("tool planning failed: {message}")]
    ToolPlanning { message: String },

    /// The tool service returned an error or a 5xx.
    #[error("tool service error ({kind}): {message}")]
    ToolService { kind: String, message: String },

    /// A step exceeded its declared time budget.
    #[error("tool '{tool}' exceeded its {budget_ms}ms budget")]
    ToolTimeout { tool: String, budget_ms: u64 },

    /// Post-call result validation failed.
    #[error("tool execution failed: {message}")]
    ToolExecution { message: String },

    /// Transport-level failure talking to the LLM provider.
    #[error("llm error: {message}")]
    Llm { message: String, retryable: bool },

    /// Configuration missing or invalid at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    /// Stable kind tag used in logs and experiment records.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Analysis { .. } => "analysis",
            EngineError::ContextResolution { .. } => "context_resolution",
            EngineError::ToolPlanning { .. } => "tool_planning",
            EngineError::ToolService { .. } => "tool_service",
            EngineError::ToolTimeout { .. } => "tool_timeout",
            EngineError::ToolExecution { .. } => "tool_execution",
            EngineError::Llm { .. } => "llm",
            EngineError::Configuration(_) => "configuration",
        }
    }

    /// Whether a transport-level retry is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Llm { retryable: true, .. })
    }

    /// Map an error kind to the reply shown to the user when the
    /// orchestrator gives up. Wording intentionally avoids internals.
    pub fn user_friendly_message(&self) -> &'static str {
        match self {
            EngineError::Analysis { .. } => "抱歉，我没能理解您的消息，请换个说法试试。",
            EngineError::ContextResolution { .. } => "抱歉，我暂时取不到相关的背景信息，请稍后再试。",
            EngineError::ToolPlanning { .. } | EngineError::ToolExecution { .. } => {
                "抱歉，这个操作我没能完成，请稍后再试。"
            }
            EngineError::ToolService { .. } => "抱歉，这个操作我没能完成，请稍后再试。",
            EngineError::ToolTimeout { .. } => "操作超时了，请稍后重试。",
            EngineError::Llm { .. } => "AI 服务暂时不可用，请稍后重试。",
            EngineError::Configuration(_) => "系统暂时出现问题，请稍后重试。",
        }
    }
}

/// Errors from repository operations (trait definitions live in hearth-core,
/// implementations in hearth-infra).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        EngineError::ToolService {
            kind: "internal".to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        let err = EngineError::ToolTimeout {
            tool: "search".to_string(),
            budget_ms: 3000,
        };
        assert_eq!(err.kind(), "tool_timeout");

        let err = EngineError::Analysis {
            message: "bad json".to_string(),
            round: 2,
            raw_snippet: None,
        };
        assert_eq!(err.kind(), "analysis");
    }

    #[test]
    fn test_display_includes_context() {
        let err = EngineError::ToolTimeout {
            tool: "render_chart".to_string(),
            budget_ms: 6000,
        };
        assert!(err.to_string().contains("render_chart"));
        assert!(err.to_string().contains("6000"));
    }

    #[test]
    fn test_only_transport_llm_errors_retry() {
        let retryable = EngineError::Llm {
            message: "connection reset".to_string(),
            retryable: true,
        };
        assert!(retryable.is_retryable());

        let fatal = EngineError::Analysis {
            message: "schema violation".to_string(),
            round: 1,
            raw_snippet: Some("{".to_string()),
        };
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn test_repository_error_maps_to_tool_service() {
        let err: EngineError = RepositoryError::Query("syntax error".to_string()).into();
        assert_eq!(err.kind(), "tool_service");
    }
}
