//! Router for the ingress API.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/message", post(handlers::message::post_message))
        .route("/webhook/{channel}", post(handlers::webhook::post_webhook))
        .route("/health", get(handlers::health::get_health))
        .route("/media/{id}", get(handlers::media::get_media))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
