//! POST /webhook/{channel} - channel ingress.
//!
//! Transport-level concerns (E2E decryption, signature checks) live in the
//! channel gateway in front of this endpoint; by the time a payload lands
//! here it carries plaintext. The sender address resolves to a principal
//! through the `user_channels` binding, created on first contact.

use std::time::Instant;

use axum::extract::{Path, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use hearth_types::message::{Attachment, MessageContext};

use crate::http::handlers::message::MessageResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    /// Channel-side sender address (Threema ID, email address, ...).
    #[serde(alias = "sender_id", alias = "from")]
    pub channel_user_id: String,

    #[serde(default, alias = "text")]
    pub content: String,

    #[serde(default)]
    pub thread_id: Option<String>,

    #[serde(default)]
    pub nickname: Option<String>,

    #[serde(default)]
    pub shared_thread: bool,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    #[serde(default)]
    pub timezone: Option<String>,
}

pub async fn post_webhook(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Json(payload): Json<WebhookPayload>,
) -> Json<MessageResponse> {
    let started = Instant::now();
    let trace_id = Uuid::new_v4();

    let channel_data = payload
        .nickname
        .as_ref()
        .map(|nickname| serde_json::json!({"nickname": nickname}));
    let principal = match state
        .principals
        .resolve_channel(&channel, &payload.channel_user_id, channel_data.as_ref())
        .await
    {
        Ok(principal) => principal,
        Err(err) => {
            warn!(trace_id = %trace_id, channel = %channel, error = %err, "channel resolution failed");
            return Json(MessageResponse {
                response: "系统暂时出现问题，请稍后重试。".to_string(),
                trace_id,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
    };

    info!(
        trace_id = %trace_id,
        channel = %channel,
        user_id = %principal,
        "webhook message accepted"
    );

    // A channel conversation defaults to one thread per sender.
    let thread_id = payload
        .thread_id
        .unwrap_or_else(|| format!("{channel}:{}", payload.channel_user_id));

    let ctx = MessageContext {
        trace_id,
        channel: Some(channel),
        thread_id: Some(thread_id),
        shared_thread: payload.shared_thread,
        attachments: payload.attachments,
        timezone: payload.timezone,
    };

    let deadline = state.config.message_deadline;
    let response = match tokio::time::timeout(
        deadline,
        state.orchestrator.process(&payload.content, principal, &ctx),
    )
    .await
    {
        Ok(reply) => reply,
        Err(_) => "这个问题我需要更多时间处理，请稍后再问一次。".to_string(),
    };

    Json(MessageResponse {
        response,
        trace_id,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Channel payloads sometimes nest the interesting fields; expose a hook
/// for gateway-specific extraction without teaching the engine any
/// channel's schema.
#[allow(dead_code)]
pub fn extract_text(payload: &Value) -> Option<&str> {
    payload
        .get("content")
        .or_else(|| payload.get("text"))
        .or_else(|| payload.get("message").and_then(|m| m.get("text")))
        .and_then(Value::as_str)
}
