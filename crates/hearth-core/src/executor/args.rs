//! Per-step argument preparation: cross-step references, scope injection,
//! and the JSON-path helper the `arg_from_step` reference uses.

use hearth_types::error::EngineError;
use hearth_types::scope::ScopeTarget;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::StepResult;

/// Placeholder replaced with the id of the most recent successful `store`.
pub const LAST_STORE_ID: &str = "$LAST_STORE_ID";

/// Resolve cross-step references inside `args`.
///
/// - `"$LAST_STORE_ID"` (or as a substring) → the last store id.
/// - `{"use_context": "<name>"}` → the named `context_payload` entry.
/// - `{"arg_from_step": i, "path": "a.b"}` → a value from a prior result.
pub fn resolve_references(
    args: &Value,
    last_store_id: Option<&str>,
    context_payload: &Map<String, Value>,
    prior_results: &[StepResult],
) -> Result<Value, EngineError> {
    match args {
        Value::String(s) if s.contains(LAST_STORE_ID) => {
            let id = last_store_id.ok_or_else(|| EngineError::ToolPlanning {
                message: "$LAST_STORE_ID referenced before any successful store".to_string(),
            })?;
            Ok(Value::String(s.replace(LAST_STORE_ID, id)))
        }
        Value::Object(map) => {
            if let Some(name) = map.get("use_context").and_then(Value::as_str) {
                return context_payload.get(name).cloned().ok_or_else(|| {
                    EngineError::ToolPlanning {
                        message: format!("use_context '{name}' is not in the context payload"),
                    }
                });
            }
            if let Some(index) = map.get("arg_from_step").and_then(Value::as_u64) {
                let result = prior_results.get(index as usize).ok_or_else(|| {
                    EngineError::ToolPlanning {
                        message: format!("arg_from_step {index} is out of range"),
                    }
                })?;
                let output = result.output.as_ref().ok_or_else(|| EngineError::ToolPlanning {
                    message: format!("arg_from_step {index} references a failed step"),
                })?;
                let path = map.get("path").and_then(Value::as_str).unwrap_or("");
                return json_path(output, path).cloned().ok_or_else(|| {
                    EngineError::ToolPlanning {
                        message: format!("path '{path}' not found in step {index} result"),
                    }
                });
            }

            let mut resolved = Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(
                    key.clone(),
                    resolve_references(value, last_store_id, context_payload, prior_results)?,
                );
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => {
            let resolved: Result<Vec<Value>, EngineError> = items
                .iter()
                .map(|v| resolve_references(v, last_store_id, context_payload, prior_results))
                .collect();
            Ok(Value::Array(resolved?))
        }
        other => Ok(other.clone()),
    }
}

/// Walk a dotted path (`"a.b.0"`) into a JSON value. An empty path returns
/// the value itself.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Inject the resolved scope into `args` unless the LLM set `user_id`
/// itself. A single principal is sent as a string, several as an array.
/// The thread filter (thread scope only) goes under `filters.thread_id`.
pub fn inject_scope(args: &mut Value, target: &ScopeTarget) {
    let Value::Object(map) = args else { return };
    if map.contains_key("user_id") {
        return;
    }

    map.insert("user_id".to_string(), user_ids_value(&target.user_ids));

    if let Some(thread_id) = &target.thread_filter {
        let filters = map
            .entry("filters".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(filters) = filters {
            filters
                .entry("thread_id".to_string())
                .or_insert_with(|| Value::String(thread_id.clone()));
        }
    }
}

fn user_ids_value(ids: &[Uuid]) -> Value {
    if ids.len() == 1 {
        Value::String(ids[0].to_string())
    } else {
        Value::Array(ids.iter().map(|id| Value::String(id.to_string())).collect())
    }
}
