//! HTTP surface of the tool service.
//!
//! Tool failures travel as `{error: {kind, message}}` with HTTP 200; only
//! unhandled panics become 5xx (axum's default).

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::service::ToolService;
use crate::specs;

pub fn build_router(service: Arc<ToolService>) -> Router {
    Router::new()
        .route("/tools", get(list_tools))
        .route("/tool/{name}", post(invoke_tool))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// GET /tools - the live tool catalog.
async fn list_tools() -> Json<Value> {
    Json(json!(specs::all()))
}

/// GET /health - liveness probe.
async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

/// POST /tool/{name} - invoke one tool with JSON arguments.
async fn invoke_tool(
    State(service): State<Arc<ToolService>>,
    Path(name): Path<String>,
    Json(args): Json<Value>,
) -> Json<Value> {
    match service.dispatch(&name, args).await {
        Ok(result) => Json(result),
        Err(envelope) => Json(json!({"error": envelope})),
    }
}
