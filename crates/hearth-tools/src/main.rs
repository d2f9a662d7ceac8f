//! Tool service binary.
//!
//! Serves the generic tool set over HTTP: `GET /tools` for the catalog,
//! `POST /tool/<name>` for invocations. Backed by Postgres; encodes no
//! business vocabulary.

mod chart;
mod http;
mod service;
mod specs;

use std::sync::Arc;

use anyhow::Context;

use crate::service::ToolService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hearth_observe::tracing_setup::init_tracing()
        .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    let strict_mode = std::env::var("MCP_STRICT_MODE")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let media_root = std::env::var("MEDIA_ROOT").unwrap_or_else(|_| "/data/media".to_string());
    let signing_secret = std::env::var("SIGNING_SECRET").ok().filter(|s| !s.is_empty());
    let bind_addr =
        std::env::var("TOOL_SERVICE_BIND").unwrap_or_else(|_| "0.0.0.0:8100".to_string());

    let pool = hearth_infra::postgres::connect(&database_url)
        .await
        .context("database connection failed")?;

    let service = Arc::new(ToolService::new(
        pool,
        strict_mode,
        media_root.into(),
        signing_secret,
    ));

    let router = http::build_router(service);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, strict_mode, "tool service listening");

    axum::serve(listener, router).await.context("server terminated")?;
    Ok(())
}
