//! The tool catalog served by `GET /tools` and injected into prompts.

use serde_json::json;

use hearth_types::tool::{self, ToolSpec, time_budget};

fn spec(
    name: &str,
    description: &str,
    input_schema: serde_json::Value,
    capabilities: &[&str],
    latency: &str,
) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
        x_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        x_time_budget: time_budget(name).as_millis() as u64,
        x_latency_hint: latency.to_string(),
    }
}

/// Shared filter grammar, referenced from several tool schemas.
fn filters_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "id": {"type": "string", "format": "uuid"},
            "type": {"type": "string"},
            "thread_id": {"type": "string"},
            "category": {"type": "string"},
            "person": {"type": "string"},
            "channel": {"type": "string"},
            "date_from": {"type": "string", "format": "date-time"},
            "date_to": {"type": "string", "format": "date-time"},
            "amount_min": {"type": "number"},
            "amount_max": {"type": "number"},
            "jsonb_equals": {"type": "object"},
            "deleted": {"type": "boolean"},
            "shared_thread": {"type": "boolean"},
            "limit": {"type": "integer", "minimum": 1, "maximum": 200}
        }
    })
}

fn user_id_schema() -> serde_json::Value {
    json!({
        "oneOf": [
            {"type": "string", "format": "uuid"},
            {"type": "array", "items": {"type": "string", "format": "uuid"}}
        ]
    })
}

/// All tool specs, in catalog order.
pub fn all() -> Vec<ToolSpec> {
    vec![
        spec(
            tool::TOOL_STORE,
            "Persist one observation. You decide the shape of ai_data; amount and occurred_at are extracted for indexed queries. An external_id makes the call an upsert.",
            json!({
                "type": "object",
                "required": ["user_id", "content"],
                "properties": {
                    "user_id": {"type": "string", "format": "uuid"},
                    "content": {"type": "string", "minLength": 1},
                    "ai_data": {"type": "object"},
                    "embedding": {"type": "array", "items": {"type": "number"}}
                }
            }),
            &["write"],
            "fast",
        ),
        spec(
            tool::TOOL_SEARCH,
            "Retrieve memories. Vector ranking with query_embedding, text similarity with query, newest-first otherwise.",
            json!({
                "type": "object",
                "required": ["user_id"],
                "properties": {
                    "user_id": user_id_schema(),
                    "query": {"type": "string"},
                    "query_embedding": {"type": "array", "items": {"type": "number"}},
                    "filters": filters_schema()
                }
            }),
            &["read"],
            "fast",
        ),
        spec(
            tool::TOOL_AGGREGATE,
            "Numeric aggregation (sum/avg/min/max/count) over a physicalized column or a numeric JSONB path, optionally grouped by day/week/month or by an ai_understanding field.",
            json!({
                "type": "object",
                "required": ["user_id", "operation"],
                "properties": {
                    "user_id": user_id_schema(),
                    "operation": {"enum": ["sum", "avg", "min", "max", "count"]},
                    "field": {"type": "string"},
                    "filters": filters_schema(),
                    "group_by": {"enum": ["day", "week", "month"]},
                    "group_by_ai_field": {"type": "string"}
                }
            }),
            &["read"],
            "fast",
        ),
        spec(
            tool::TOOL_UPDATE_MEMORY_FIELDS,
            "Shallow-merge fields into a memory's ai_understanding and refresh the indexed columns.",
            json!({
                "type": "object",
                "required": ["id", "fields"],
                "properties": {
                    "id": {"type": "string", "format": "uuid"},
                    "fields": {"type": "object"}
                }
            }),
            &["write"],
            "fast",
        ),
        spec(
            tool::TOOL_SOFT_DELETE,
            "Mark a memory deleted (it disappears from default reads, rows are never dropped).",
            json!({
                "type": "object",
                "required": ["id"],
                "properties": {"id": {"type": "string", "format": "uuid"}}
            }),
            &["write"],
            "fast",
        ),
        spec(
            tool::TOOL_SCHEDULE_REMINDER,
            "Schedule a reminder. payload carries the message text plus optional repeat_rule/timezone; external_key makes rescheduling idempotent.",
            json!({
                "type": "object",
                "required": ["user_id", "remind_at"],
                "properties": {
                    "user_id": {"type": "string", "format": "uuid"},
                    "remind_at": {"type": "string", "format": "date-time"},
                    "payload": {},
                    "memory_id": {"type": "string", "format": "uuid"},
                    "channel": {"type": "string"},
                    "external_key": {"type": "string"}
                }
            }),
            &["write"],
            "fast",
        ),
        spec(
            tool::TOOL_GET_PENDING_REMINDERS,
            "Due and unsent reminders, optionally for one user and before a cutoff.",
            json!({
                "type": "object",
                "properties": {
                    "user_id": {"type": "string", "format": "uuid"},
                    "before": {"type": "string", "format": "date-time"}
                }
            }),
            &["read"],
            "fast",
        ),
        spec(
            tool::TOOL_MARK_REMINDER_SENT,
            "Mark a reminder delivered. Idempotent.",
            json!({
                "type": "object",
                "required": ["id"],
                "properties": {"id": {"type": "string", "format": "uuid"}}
            }),
            &["write"],
            "fast",
        ),
        spec(
            tool::TOOL_LIST_REMINDER_USER_IDS,
            "Users that still have unsent reminders.",
            json!({"type": "object", "properties": {}}),
            &["read"],
            "fast",
        ),
        spec(
            tool::TOOL_BATCH_STORE,
            "Store several memories in one transaction.",
            json!({
                "type": "object",
                "required": ["memories"],
                "properties": {"memories": {"type": "array"}}
            }),
            &["write"],
            "medium",
        ),
        spec(
            tool::TOOL_BATCH_SEARCH,
            "Run several searches in one call.",
            json!({
                "type": "object",
                "required": ["searches"],
                "properties": {"searches": {"type": "array"}}
            }),
            &["read"],
            "medium",
        ),
        spec(
            tool::TOOL_BATCH_AGGREGATE,
            "Run several aggregations in one call.",
            json!({
                "type": "object",
                "required": ["aggregates"],
                "properties": {"aggregates": {"type": "array"}}
            }),
            &["read"],
            "medium",
        ),
        spec(
            tool::TOOL_RENDER_CHART,
            "Render a line or bar chart as a PNG and return its media URL.",
            json!({
                "type": "object",
                "required": ["spec"],
                "properties": {
                    "spec": {
                        "type": "object",
                        "required": ["x_labels", "series"],
                        "properties": {
                            "kind": {"enum": ["line", "bar"]},
                            "title": {"type": "string"},
                            "x_labels": {"type": "array", "items": {"type": "string"}},
                            "series": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "required": ["name", "values"],
                                    "properties": {
                                        "name": {"type": "string"},
                                        "values": {"type": "array", "items": {"type": "number"}}
                                    }
                                }
                            }
                        }
                    }
                }
            }),
            &["render"],
            "slow",
        ),
    ]
}
