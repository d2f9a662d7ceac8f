//! Tool service wire types: tool names, specs, the filter grammar, and the
//! error envelope.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TOOL_STORE: &str = "store";
pub const TOOL_SEARCH: &str = "search";
pub const TOOL_AGGREGATE: &str = "aggregate";
pub const TOOL_UPDATE_MEMORY_FIELDS: &str = "update_memory_fields";
pub const TOOL_SOFT_DELETE: &str = "soft_delete";
pub const TOOL_SCHEDULE_REMINDER: &str = "schedule_reminder";
pub const TOOL_GET_PENDING_REMINDERS: &str = "get_pending_reminders";
pub const TOOL_MARK_REMINDER_SENT: &str = "mark_reminder_sent";
pub const TOOL_LIST_REMINDER_USER_IDS: &str = "list_reminder_user_ids";
pub const TOOL_BATCH_STORE: &str = "batch_store";
pub const TOOL_BATCH_SEARCH: &str = "batch_search";
pub const TOOL_BATCH_AGGREGATE: &str = "batch_aggregate";
pub const TOOL_RENDER_CHART: &str = "render_chart";

/// Default search limit when the caller sends none.
pub const SEARCH_DEFAULT_LIMIT: i64 = 20;
/// Hard cap regardless of what the caller asks for.
pub const SEARCH_MAX_LIMIT: i64 = 200;
/// Cap in shared-thread mode.
pub const SEARCH_SHARED_THREAD_LIMIT: i64 = 30;

/// Per-tool execution budget, used by the executor as the step deadline and
/// advertised by the tool service as `x_time_budget`.
pub fn time_budget(tool: &str) -> Duration {
    match tool {
        TOOL_STORE => Duration::from_secs(2),
        TOOL_SEARCH | TOOL_AGGREGATE => Duration::from_secs(3),
        TOOL_BATCH_STORE | TOOL_BATCH_SEARCH | TOOL_BATCH_AGGREGATE => Duration::from_secs(5),
        TOOL_RENDER_CHART => Duration::from_secs(6),
        _ => Duration::from_secs(2),
    }
}

/// Tool metadata returned by `GET /tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,

    #[serde(default)]
    pub x_capabilities: Vec<String>,

    /// Budget in milliseconds.
    pub x_time_budget: u64,

    /// Rough latency expectation: "fast" | "medium" | "slow".
    pub x_latency_hint: String,
}

/// Error envelope all tools return (with HTTP 200).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Validation,
    NotFound,
    Timeout,
    Internal,
}

/// The filter grammar shared by `search` and `aggregate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Exact record id (round-trip reads).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<uuid::Uuid>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// ISO-8601 window on `occurred_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_min: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_max: Option<f64>,

    /// Arbitrary JSONB containment, translated to `ai_understanding @> ...`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonb_equals: Option<serde_json::Map<String, Value>>,

    /// Soft-delete visibility; `false` (the default) hides deleted records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_thread: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

impl SearchFilters {
    /// The effective limit after defaults and caps.
    pub fn effective_limit(&self) -> i64 {
        let cap = if self.shared_thread.unwrap_or(false) {
            SEARCH_SHARED_THREAD_LIMIT
        } else {
            SEARCH_MAX_LIMIT
        };
        self.limit
            .filter(|l| *l > 0)
            .unwrap_or(SEARCH_DEFAULT_LIMIT)
            .min(cap)
    }
}

/// Aggregate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregateOp {
    pub fn sql_function(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "SUM",
            AggregateOp::Avg => "AVG",
            AggregateOp::Min => "MIN",
            AggregateOp::Max => "MAX",
            AggregateOp::Count => "COUNT",
        }
    }

    /// Zero-row result: 0 for sum/count, null otherwise.
    pub fn empty_result(&self) -> Value {
        match self {
            AggregateOp::Sum | AggregateOp::Count => Value::from(0),
            _ => Value::Null,
        }
    }
}

/// Time bucketing for grouped aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Day,
    Week,
    Month,
}

impl GroupBy {
    pub fn date_trunc_unit(&self) -> &'static str {
        match self {
            GroupBy::Day => "day",
            GroupBy::Week => "week",
            GroupBy::Month => "month",
        }
    }
}
