//! Ingress API binary.
//!
//! Wires the orchestration engine to its infrastructure, serves the
//! message/webhook/health/media endpoints, and runs the reminder
//! dispatcher in the background.

mod http;
mod outbound;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use hearth_core::reminder::ReminderDispatcher;
use hearth_types::config::EngineConfig;

use crate::outbound::HttpOutbound;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hearth_observe::tracing_setup::init_tracing()
        .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;

    let config = EngineConfig::from_env().context("configuration")?;
    let state = AppState::init(config.clone()).await.context("state init")?;

    // Reminder dispatcher: single background task, at-least-once delivery
    // fenced by the idempotent mark on the tool service.
    let outbound = Arc::new(HttpOutbound::from_env());
    let dispatcher = ReminderDispatcher::new(
        Arc::clone(&state.tools),
        outbound,
        config.family_shared_user_ids.clone(),
    );
    let poll_interval = std::env::var("REMINDER_POLL_SECONDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(hearth_core::reminder::POLL_INTERVAL);
    tokio::spawn(dispatcher.run(poll_interval));

    let bind_addr = std::env::var("API_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let router = http::router::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "ingress api listening");

    axum::serve(listener, router).await.context("server terminated")?;
    Ok(())
}
