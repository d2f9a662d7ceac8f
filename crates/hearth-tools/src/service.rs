//! Tool dispatch: argument validation, store calls, error envelopes.
//!
//! Every tool takes JSON and returns JSON. Failures map to the shared
//! envelope `{error: {kind, message}}` with kind ∈ validation / not_found
//! / timeout / internal, delivered with HTTP 200. In strict mode internal
//! failures always surface; lenient mode (dev only) degrades failed writes
//! to a flagged non-success payload so a broken database does not take the
//! conversation down with it.

use std::path::PathBuf;

use chrono::Utc;
use serde_json::{Value, json};
use sqlx::postgres::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use hearth_infra::postgres::memory::{
    AggregateRequest, MemoryStore, SearchRequest, StoreRequest,
};
use hearth_infra::postgres::reminder::{ReminderStore, ScheduleRequest, parse_remind_at};
use hearth_types::error::RepositoryError;
use hearth_types::tool::{self, AggregateOp, GroupBy, SearchFilters, ToolError, ToolErrorKind};

use crate::chart::{self, ChartSpec};

pub struct ToolService {
    memories: MemoryStore,
    reminders: ReminderStore,
    strict_mode: bool,
    media_root: PathBuf,
    signing_secret: Option<String>,
}

impl ToolService {
    pub fn new(
        pool: PgPool,
        strict_mode: bool,
        media_root: PathBuf,
        signing_secret: Option<String>,
    ) -> Self {
        Self {
            memories: MemoryStore::new(pool.clone()),
            reminders: ReminderStore::new(pool),
            strict_mode,
            media_root,
            signing_secret,
        }
    }

    /// Dispatch one tool invocation. The `Err` side is the wire envelope.
    pub async fn dispatch(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let started = std::time::Instant::now();
        let result = match name {
            tool::TOOL_STORE => self.store(&args).await,
            tool::TOOL_SEARCH => self.search(&args).await,
            tool::TOOL_AGGREGATE => self.aggregate(&args).await,
            tool::TOOL_UPDATE_MEMORY_FIELDS => self.update_memory_fields(&args).await,
            tool::TOOL_SOFT_DELETE => self.soft_delete(&args).await,
            tool::TOOL_SCHEDULE_REMINDER => self.schedule_reminder(&args).await,
            tool::TOOL_GET_PENDING_REMINDERS => self.get_pending_reminders(&args).await,
            tool::TOOL_MARK_REMINDER_SENT => self.mark_reminder_sent(&args).await,
            tool::TOOL_LIST_REMINDER_USER_IDS => self.list_reminder_user_ids().await,
            tool::TOOL_BATCH_STORE => self.batch_store(&args).await,
            tool::TOOL_BATCH_SEARCH => self.batch_search(&args).await,
            tool::TOOL_BATCH_AGGREGATE => self.batch_aggregate(&args).await,
            tool::TOOL_RENDER_CHART => self.render_chart(&args).await,
            other => Err(ToolError {
                kind: ToolErrorKind::NotFound,
                message: format!("unknown tool '{other}'"),
            }),
        };

        match &result {
            Ok(_) => info!(
                tool = name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "tool call completed"
            ),
            Err(err) => warn!(
                tool = name,
                kind = ?err.kind,
                message = %err.message,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "tool call failed"
            ),
        }

        // Lenient mode turns internal write failures into flagged
        // non-successes. Never in strict mode, never for reads.
        if !self.strict_mode {
            if let Err(err) = &result {
                if err.kind == ToolErrorKind::Internal && is_write_tool(name) {
                    return Ok(json!({
                        "success": false,
                        "simulated": true,
                        "detail": err.message,
                    }));
                }
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // Memory tools
    // ------------------------------------------------------------------

    async fn store(&self, args: &Value) -> Result<Value, ToolError> {
        let req = parse_store_request(args)?;
        let outcome = self.memories.store(&req).await.map_err(repo_err)?;
        Ok(json!({"success": true, "id": outcome.id.to_string(), "updated": outcome.updated}))
    }

    async fn batch_store(&self, args: &Value) -> Result<Value, ToolError> {
        let memories = args
            .get("memories")
            .and_then(Value::as_array)
            .ok_or_else(|| validation("memories must be an array"))?;
        let reqs: Vec<StoreRequest> = memories
            .iter()
            .map(parse_store_request)
            .collect::<Result<_, _>>()?;
        let outcomes = self.memories.store_batch(&reqs).await.map_err(repo_err)?;
        Ok(json!({
            "success": true,
            "ids": outcomes.iter().map(|o| o.id.to_string()).collect::<Vec<_>>(),
        }))
    }

    async fn search(&self, args: &Value) -> Result<Value, ToolError> {
        let req = parse_search_request(args)?;
        let records = self.memories.search(&req).await.map_err(repo_err)?;
        let total = records.len();
        Ok(json!({"results": records, "total": total}))
    }

    async fn batch_search(&self, args: &Value) -> Result<Value, ToolError> {
        let searches = args
            .get("searches")
            .and_then(Value::as_array)
            .ok_or_else(|| validation("searches must be an array"))?;
        let mut results = Vec::with_capacity(searches.len());
        for search_args in searches {
            results.push(self.search(search_args).await?);
        }
        Ok(json!({"results": results}))
    }

    async fn aggregate(&self, args: &Value) -> Result<Value, ToolError> {
        let req = parse_aggregate_request(args)?;
        let grouped = req.group_by.is_some() || req.group_by_ai_field.is_some();
        let result = self.memories.aggregate(&req).await.map_err(repo_err)?;
        let field = req.field.clone().unwrap_or_else(|| "amount".to_string());
        if grouped {
            Ok(json!({"operation": req.op, "field": field, "groups": result}))
        } else {
            Ok(json!({"operation": req.op, "field": field, "result": result}))
        }
    }

    async fn batch_aggregate(&self, args: &Value) -> Result<Value, ToolError> {
        let aggregates = args
            .get("aggregates")
            .and_then(Value::as_array)
            .ok_or_else(|| validation("aggregates must be an array"))?;
        let mut results = Vec::with_capacity(aggregates.len());
        for aggregate_args in aggregates {
            results.push(self.aggregate(aggregate_args).await?);
        }
        Ok(json!({"results": results}))
    }

    async fn update_memory_fields(&self, args: &Value) -> Result<Value, ToolError> {
        let id = parse_uuid_field(args, "id")?;
        let fields = args
            .get("fields")
            .filter(|f| f.is_object())
            .ok_or_else(|| validation("fields must be an object"))?;
        self.memories.update_fields(id, fields).await.map_err(repo_err)?;
        Ok(json!({"success": true, "id": id.to_string()}))
    }

    async fn soft_delete(&self, args: &Value) -> Result<Value, ToolError> {
        let id = parse_uuid_field(args, "id")?;
        self.memories.soft_delete(id).await.map_err(repo_err)?;
        Ok(json!({"success": true, "id": id.to_string()}))
    }

    // ------------------------------------------------------------------
    // Reminder tools
    // ------------------------------------------------------------------

    async fn schedule_reminder(&self, args: &Value) -> Result<Value, ToolError> {
        let user_id = parse_uuid_field(args, "user_id")?;
        let remind_at_raw = args
            .get("remind_at")
            .and_then(Value::as_str)
            .ok_or_else(|| validation("remind_at is required"))?;
        let remind_at = parse_remind_at(remind_at_raw).map_err(repo_err)?;

        let payload = match args.get("payload") {
            Some(Value::String(text)) => json!({"text": text}),
            Some(other) if !other.is_null() => other.clone(),
            _ => json!({}),
        };
        let memory_id = match args.get("memory_id") {
            Some(Value::String(raw)) => Some(
                Uuid::parse_str(raw).map_err(|_| validation("memory_id must be a UUID"))?,
            ),
            _ => None,
        };

        let req = ScheduleRequest {
            user_id,
            remind_at,
            payload,
            memory_id,
            channel: args.get("channel").and_then(Value::as_str).map(str::to_string),
            external_key: args
                .get("external_key")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        let id = self.reminders.schedule(&req).await.map_err(repo_err)?;
        Ok(json!({"success": true, "id": id.to_string()}))
    }

    async fn get_pending_reminders(&self, args: &Value) -> Result<Value, ToolError> {
        let user_id = match args.get("user_id") {
            Some(Value::String(raw)) => Some(
                Uuid::parse_str(raw).map_err(|_| validation("user_id must be a UUID"))?,
            ),
            _ => None,
        };
        let before = match args.get("before").and_then(Value::as_str) {
            Some(raw) => parse_remind_at(raw).map_err(repo_err)?,
            None => Utc::now(),
        };
        let reminders = self.reminders.pending(user_id, before).await.map_err(repo_err)?;
        Ok(json!({"reminders": reminders}))
    }

    async fn mark_reminder_sent(&self, args: &Value) -> Result<Value, ToolError> {
        let id = parse_uuid_field(args, "id")?;
        self.reminders.mark_sent(id).await.map_err(repo_err)?;
        Ok(json!({"success": true}))
    }

    async fn list_reminder_user_ids(&self) -> Result<Value, ToolError> {
        let ids = self.reminders.user_ids_with_pending().await.map_err(repo_err)?;
        Ok(json!({
            "success": true,
            "user_ids": ids.iter().map(Uuid::to_string).collect::<Vec<_>>(),
        }))
    }

    // ------------------------------------------------------------------
    // Charts
    // ------------------------------------------------------------------

    async fn render_chart(&self, args: &Value) -> Result<Value, ToolError> {
        let spec: ChartSpec = serde_json::from_value(
            args.get("spec").cloned().unwrap_or_else(|| args.clone()),
        )
        .map_err(|e| validation(&format!("invalid chart spec: {e}")))?;

        let media_id = chart::render(&spec, &self.media_root).map_err(|e| ToolError {
            kind: ToolErrorKind::Internal,
            message: format!("chart rendering failed: {e}"),
        })?;

        let url = hearth_infra::media::signed_path(
            &media_id,
            self.signing_secret.as_deref(),
            Utc::now().timestamp(),
            3600,
        );
        Ok(json!({"success": true, "url": url}))
    }
}

fn is_write_tool(name: &str) -> bool {
    matches!(
        name,
        tool::TOOL_STORE
            | tool::TOOL_BATCH_STORE
            | tool::TOOL_UPDATE_MEMORY_FIELDS
            | tool::TOOL_SOFT_DELETE
            | tool::TOOL_SCHEDULE_REMINDER
            | tool::TOOL_MARK_REMINDER_SENT
    )
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

fn validation(message: &str) -> ToolError {
    ToolError {
        kind: ToolErrorKind::Validation,
        message: message.to_string(),
    }
}

fn repo_err(err: RepositoryError) -> ToolError {
    let kind = match err {
        RepositoryError::NotFound => ToolErrorKind::NotFound,
        RepositoryError::Query(_) | RepositoryError::Conflict(_) => ToolErrorKind::Validation,
        RepositoryError::Connection => ToolErrorKind::Internal,
    };
    ToolError {
        kind,
        message: err.to_string(),
    }
}

fn parse_uuid_field(args: &Value, field: &str) -> Result<Uuid, ToolError> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| validation(&format!("{field} is required")))
        .and_then(|raw| {
            Uuid::parse_str(raw).map_err(|_| validation(&format!("{field} must be a UUID")))
        })
}

/// `user_id` may be one principal id or a list; a list becomes
/// `user_id = ANY(...)` downstream.
fn parse_user_ids(args: &Value) -> Result<Vec<Uuid>, ToolError> {
    match args.get("user_id") {
        Some(Value::String(raw)) => Ok(vec![
            Uuid::parse_str(raw).map_err(|_| validation("user_id must be a UUID"))?,
        ]),
        Some(Value::Array(items)) => {
            if items.is_empty() {
                return Err(validation("user_id list must not be empty"));
            }
            items
                .iter()
                .map(|item| {
                    item.as_str()
                        .ok_or_else(|| validation("user_id list entries must be strings"))
                        .and_then(|raw| {
                            Uuid::parse_str(raw)
                                .map_err(|_| validation("user_id must be a UUID"))
                        })
                })
                .collect()
        }
        _ => Err(validation("user_id is required")),
    }
}

fn parse_filters(args: &Value) -> Result<SearchFilters, ToolError> {
    match args.get("filters") {
        None | Some(Value::Null) => Ok(SearchFilters::default()),
        Some(filters) => serde_json::from_value(filters.clone())
            .map_err(|e| validation(&format!("invalid filters: {e}"))),
    }
}

fn parse_store_request(args: &Value) -> Result<StoreRequest, ToolError> {
    let user_id = parse_uuid_field(args, "user_id")?;
    let content = args
        .get("content")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| validation("content must be a non-empty string"))?;
    let ai_data = match args.get("ai_data") {
        None | Some(Value::Null) => json!({}),
        Some(ai_data) if ai_data.is_object() => ai_data.clone(),
        Some(_) => return Err(validation("ai_data must be an object")),
    };
    let embedding = match args.get("embedding") {
        None | Some(Value::Null) => None,
        Some(embedding) => Some(
            serde_json::from_value::<Vec<f32>>(embedding.clone())
                .map_err(|_| validation("embedding must be an array of numbers"))?,
        ),
    };
    Ok(StoreRequest {
        user_id,
        content: content.to_string(),
        ai_data,
        embedding,
    })
}

fn parse_search_request(args: &Value) -> Result<SearchRequest, ToolError> {
    let user_ids = parse_user_ids(args)?;
    let filters = parse_filters(args)?;
    let query = args
        .get("query")
        .and_then(Value::as_str)
        .filter(|q| !q.is_empty())
        .map(str::to_string);
    let query_embedding = match args.get("query_embedding") {
        None | Some(Value::Null) => None,
        Some(embedding) => Some(
            serde_json::from_value::<Vec<f32>>(embedding.clone())
                .map_err(|_| validation("query_embedding must be an array of numbers"))?,
        ),
    };
    Ok(SearchRequest {
        user_ids,
        query,
        query_embedding,
        filters,
    })
}

fn parse_aggregate_request(args: &Value) -> Result<AggregateRequest, ToolError> {
    let user_ids = parse_user_ids(args)?;
    let op: AggregateOp = args
        .get("operation")
        .cloned()
        .ok_or_else(|| validation("operation is required"))
        .and_then(|op| {
            serde_json::from_value(op)
                .map_err(|_| validation("operation must be one of sum/avg/min/max/count"))
        })?;
    let group_by: Option<GroupBy> = match args.get("group_by") {
        None | Some(Value::Null) => None,
        Some(group_by) => Some(
            serde_json::from_value(group_by.clone())
                .map_err(|_| validation("group_by must be day/week/month"))?,
        ),
    };
    Ok(AggregateRequest {
        user_ids,
        op,
        field: args.get("field").and_then(Value::as_str).map(str::to_string),
        filters: parse_filters(args)?,
        group_by,
        group_by_ai_field: args
            .get("group_by_ai_field")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_ids_single_and_list() {
        let id_a = Uuid::now_v7();
        let id_b = Uuid::now_v7();

        let single = parse_user_ids(&json!({"user_id": id_a.to_string()})).unwrap();
        assert_eq!(single, vec![id_a]);

        let many =
            parse_user_ids(&json!({"user_id": [id_a.to_string(), id_b.to_string()]})).unwrap();
        assert_eq!(many, vec![id_a, id_b]);
    }

    #[test]
    fn test_parse_user_ids_failures() {
        assert!(parse_user_ids(&json!({})).is_err());
        assert!(parse_user_ids(&json!({"user_id": "not-a-uuid"})).is_err());
        assert!(parse_user_ids(&json!({"user_id": []})).is_err());
        assert!(parse_user_ids(&json!({"user_id": [42]})).is_err());
    }

    #[test]
    fn test_parse_store_request_validation() {
        let id = Uuid::now_v7().to_string();

        let ok = parse_store_request(&json!({
            "user_id": id,
            "content": "今天买菜花了80元",
            "ai_data": {"type": "expense", "amount": 80},
            "embedding": [0.1, 0.2]
        }))
        .unwrap();
        assert_eq!(ok.content, "今天买菜花了80元");
        assert_eq!(ok.embedding.as_ref().unwrap().len(), 2);

        assert!(parse_store_request(&json!({"user_id": id})).is_err());
        assert!(parse_store_request(&json!({"user_id": id, "content": ""})).is_err());
        assert!(
            parse_store_request(&json!({"user_id": id, "content": "x", "ai_data": "str"})).is_err()
        );
    }

    #[test]
    fn test_parse_search_request_defaults() {
        let id = Uuid::now_v7().to_string();
        let req = parse_search_request(&json!({"user_id": id})).unwrap();
        assert!(req.query.is_none());
        assert!(req.query_embedding.is_none());
        assert_eq!(req.filters.effective_limit(), 20);
    }

    #[test]
    fn test_parse_aggregate_request() {
        let id = Uuid::now_v7().to_string();
        let req = parse_aggregate_request(&json!({
            "user_id": id,
            "operation": "sum",
            "group_by": "month",
            "filters": {"type": "expense"}
        }))
        .unwrap();
        assert_eq!(req.op, AggregateOp::Sum);
        assert_eq!(req.group_by, Some(GroupBy::Month));
        assert_eq!(req.filters.record_type.as_deref(), Some("expense"));

        assert!(parse_aggregate_request(&json!({"user_id": id})).is_err());
        assert!(
            parse_aggregate_request(&json!({"user_id": id, "operation": "median"})).is_err()
        );
    }

    #[test]
    fn test_repo_err_kinds() {
        assert_eq!(repo_err(RepositoryError::NotFound).kind, ToolErrorKind::NotFound);
        assert_eq!(
            repo_err(RepositoryError::Query("bad".to_string())).kind,
            ToolErrorKind::Validation
        );
        assert_eq!(repo_err(RepositoryError::Connection).kind, ToolErrorKind::Internal);
    }

    #[test]
    fn test_is_write_tool() {
        assert!(is_write_tool(tool::TOOL_STORE));
        assert!(is_write_tool(tool::TOOL_MARK_REMINDER_SENT));
        assert!(!is_write_tool(tool::TOOL_SEARCH));
        assert!(!is_write_tool(tool::TOOL_RENDER_CHART));
    }
}
