//! Memory and reminder records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One persisted observation. `ai_understanding` is an open document; the
/// physicalized fields mirror its conventional keys for indexed queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub ai_understanding: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub person: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// `ai_understanding.deleted == true` marks a soft-deleted record.
    pub fn is_deleted(&self) -> bool {
        self.ai_understanding
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A scheduled reminder row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: Uuid,
    pub user_id: Uuid,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<Uuid>,

    pub remind_at: DateTime<Utc>,

    /// Free-form payload: message text plus optional `repeat_rule`,
    /// `timezone`, `external_key`.
    #[serde(default)]
    pub payload: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl Reminder {
    /// Due iff the schedule time has passed and it was never sent.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.sent_at.is_none() && self.remind_at <= now
    }

    /// The human-readable message carried in the payload.
    pub fn message_text(&self) -> Option<&str> {
        match &self.payload {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map
                .get("text")
                .or_else(|| map.get("message"))
                .and_then(Value::as_str),
            _ => None,
        }
    }
}
