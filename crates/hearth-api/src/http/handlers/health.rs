//! GET /health - component health rollup.

use axum::extract::State;
use axum::response::Json;
use serde_json::{Value, json};

use hearth_core::tool::ToolClient;

use crate::state::AppState;

pub async fn get_health(State(state): State<AppState>) -> Json<Value> {
    let db_ok = hearth_infra::postgres::pool::ping(&state.pool).await;
    let tools_ok = state.tools.specs().await.is_ok();
    let llm_configured = !state.config.openai_api_key.is_empty();

    let status = if db_ok && tools_ok {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "components": {
            "db": if db_ok { "ok" } else { "down" },
            "tool_service": if tools_ok { "ok" } else { "down" },
            "llm": if llm_configured { "configured" } else { "unconfigured" },
        },
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
