//! Outbound delivery adapter for reminders.
//!
//! The real channel gateways (messenger, email) are external services;
//! this adapter POSTs `{user_id, channel, text}` to the configured
//! `OUTBOUND_WEBHOOK_URL`. Without one, deliveries are logged and treated
//! as accepted, which keeps development loops quiet.

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use hearth_core::reminder::OutboundChannel;
use hearth_types::error::EngineError;

pub struct HttpOutbound {
    client: reqwest::Client,
    url: Option<String>,
}

impl HttpOutbound {
    pub fn from_env() -> Self {
        let url = std::env::var("OUTBOUND_WEBHOOK_URL").ok().filter(|u| !u.is_empty());
        if url.is_none() {
            warn!("OUTBOUND_WEBHOOK_URL not set, reminders will only be logged");
        }
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            url,
        }
    }
}

impl OutboundChannel for HttpOutbound {
    async fn send(
        &self,
        user_id: Uuid,
        channel: Option<&str>,
        text: &str,
    ) -> Result<bool, EngineError> {
        let Some(url) = &self.url else {
            info!(user_id = %user_id, channel = channel.unwrap_or("-"), text, "reminder (log-only delivery)");
            return Ok(true);
        };

        let response = self
            .client
            .post(url)
            .json(&json!({"user_id": user_id.to_string(), "channel": channel, "text": text}))
            .send()
            .await
            .map_err(|e| EngineError::ToolService {
                kind: "internal".to_string(),
                message: format!("outbound delivery failed: {e}"),
            })?;

        Ok(response.status().is_success())
    }
}
