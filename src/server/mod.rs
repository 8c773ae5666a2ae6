use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::pipeline::Pipeline;
use crate::registry::{ExternalRef, ResolveError, TokenRegistry};
use crate::vault::VaultSync;

/// Shared application state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub registry: Arc<TokenRegistry>,
    pub vault: Arc<VaultSync>,
}

/// Build the HTTP facade.
///
/// CORS is wide open: the original deployments served browser apps on other
/// origins and every response here is already token-gated.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(submit_handler))
        .route("/download", get(download_handler))
        .route("/health", get(health_handler))
        .route("/refresh-cookies", get(refresh_handler).post(refresh_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct SubmitParams {
    url: Option<String>,
    record_id: Option<String>,
    user_id: Option<String>,
}

/// `GET /?url=...` - accept a job, return its token immediately
async fn submit_handler(
    State(state): State<AppState>,
    Query(params): Query<SubmitParams>,
) -> Response {
    let Some(url) = params.url.filter(|u| !u.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing url parameter" })),
        )
            .into_response();
    };

    // Integrated mode needs both coordinates; anything less runs standalone.
    let external_ref = match (params.record_id, params.user_id) {
        (Some(record_id), Some(user_id)) => Some(ExternalRef { record_id, user_id }),
        _ => None,
    };

    let token = state.pipeline.submit(url, external_ref);
    (StatusCode::ACCEPTED, Json(json!({ "token": token }))).into_response()
}

#[derive(Deserialize)]
struct DownloadParams {
    token: Option<String>,
}

/// `GET /download?token=...` - one-shot artifact delivery.
///
/// A successful response consumes the token; the artifact file is unlinked
/// as soon as it is opened for streaming, so the bytes go out once and the
/// disk space is reclaimed when the stream ends.
async fn download_handler(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> Response {
    let Some(token) = params.token.filter(|t| !t.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing token parameter" })),
        )
            .into_response();
    };

    match state.registry.resolve(&token) {
        Err(ResolveError::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "invalid or expired token" })),
        )
            .into_response(),
        Err(ResolveError::Pending) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "processing",
                "message": "File is being prepared. Please try again in a few seconds."
            })),
        )
            .into_response(),
        Err(ResolveError::Failed(detail)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "detail": detail })),
        )
            .into_response(),
        Ok(path) => match tokio::fs::File::open(&path).await {
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "ready artifact missing on disk");
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": "file not found" })),
                )
                    .into_response()
            }
            Ok(file) => {
                // Unlink while the handle is open; the stream below still
                // reads the full contents.
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "could not unlink served artifact");
                }

                let stream = ReaderStream::new(file);
                let mut response = Body::from_stream(stream).into_response();
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    "audio/mpeg".parse().expect("static header value"),
                );
                response.headers_mut().insert(
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"audio.mp3\""
                        .parse()
                        .expect("static header value"),
                );
                response
            }
        },
    }
}

/// `GET /health` - liveness plus credential-freshness probe
async fn health_handler(State(state): State<AppState>) -> Response {
    let last = state.vault.last_report();
    Json(json!({
        "status": "ok",
        "cookies_loaded": state.vault.cookies_loaded(),
        "vault": state.vault.status(),
        "active_jobs": state.registry.active_jobs(),
        "last_sync": last.as_ref().filter(|r| r.success).map(|r| r.at),
        "last_error": last.as_ref().and_then(|r| r.error.clone()),
    }))
    .into_response()
}

/// `GET|POST /refresh-cookies` - force a vault sync now
async fn refresh_handler(State(state): State<AppState>) -> Response {
    let report = state.vault.fetch_now().await;
    Json(report).into_response()
}
