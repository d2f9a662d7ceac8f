//! POST /message - the direct ingress for one user utterance.
//!
//! Always 200 with a user-readable `response`; handled failures (over-long
//! content, deadline expiry) produce friendly text rather than error
//! statuses. 5xx is reserved for unhandled panics.

use std::time::Instant;

use axum::extract::State;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use hearth_types::message::{Attachment, MessageContext};
use hearth_types::principal::principal_id_for_key;

use crate::state::AppState;

/// Content at or above this size is rejected at ingress.
const MAX_CONTENT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub content: String,

    /// Principal key or UUID.
    pub user_id: String,

    #[serde(default)]
    pub thread_id: Option<String>,

    #[serde(default)]
    pub channel: Option<String>,

    #[serde(default)]
    pub shared_thread: bool,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    #[serde(default)]
    pub timezone: Option<String>,

    /// Passed through for channel-specific metadata; unused by the engine.
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub response: String,
    pub trace_id: Uuid,
    pub elapsed_ms: u64,
}

pub async fn post_message(
    State(state): State<AppState>,
    Json(request): Json<MessageRequest>,
) -> Json<MessageResponse> {
    let started = Instant::now();
    let trace_id = Uuid::new_v4();

    if request.content.len() >= MAX_CONTENT_BYTES {
        warn!(trace_id = %trace_id, bytes = request.content.len(), "oversized message rejected");
        return Json(MessageResponse {
            response: "消息太长了，请分几条发给我。".to_string(),
            trace_id,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }

    let principal = principal_id_for_key(&request.user_id);
    if let Err(err) = state.principals.ensure_many(&[principal]).await {
        warn!(trace_id = %trace_id, error = %err, "principal provisioning failed");
    }

    let ctx = MessageContext {
        trace_id,
        channel: request.channel,
        thread_id: request.thread_id,
        shared_thread: request.shared_thread,
        attachments: request.attachments,
        timezone: request.timezone,
    };

    let deadline = state.config.message_deadline;
    let response = match tokio::time::timeout(
        deadline,
        state.orchestrator.process(&request.content, principal, &ctx),
    )
    .await
    {
        Ok(reply) => reply,
        Err(_) => {
            warn!(trace_id = %trace_id, deadline_ms = deadline.as_millis() as u64, "message deadline expired");
            "这个问题我需要更多时间处理，请稍后再问一次。".to_string()
        }
    };

    Json(MessageResponse {
        response,
        trace_id,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}
