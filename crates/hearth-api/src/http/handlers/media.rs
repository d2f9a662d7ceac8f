//! GET /media/{id} - serve chart outputs, honoring signed URLs.

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MediaQuery {
    #[serde(default)]
    pub exp: Option<i64>,

    #[serde(default)]
    pub sig: Option<String>,
}

pub async fn get_media(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
    Query(query): Query<MediaQuery>,
) -> Response {
    // Path traversal guard: media ids are flat file names.
    if media_id.contains('/') || media_id.contains("..") {
        return (StatusCode::BAD_REQUEST, "invalid media id").into_response();
    }

    let now = chrono::Utc::now().timestamp();
    if !hearth_infra::media::verify(
        state.config.signing_secret.as_deref(),
        &media_id,
        query.exp,
        query.sig.as_deref(),
        now,
    ) {
        return (StatusCode::FORBIDDEN, "invalid or expired signature").into_response();
    }

    let path = std::path::Path::new(&state.config.media_root).join(&media_id);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let content_type = if media_id.ends_with(".png") {
                "image/png"
            } else {
                "application/octet-stream"
            };
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(_) => (StatusCode::NOT_FOUND, "media not found").into_response(),
    }
}
