use crate::server::AppState;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use bg_engine::UserId;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SetHandoverParams {
    /// Overrides the configured TTL for this flag.
    #[serde(default)]
    minutes: Option<u64>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route(
        "/api/v1/handover/{user_id}",
        get(get_handover).put(set_handover).delete(clear_handover),
    )
}

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn error(status: StatusCode, message: impl std::fmt::Display) -> ApiResponse {
    (
        status,
        Json(serde_json::json!({ "status": "error", "error": message.to_string() })),
    )
}

fn parse_user(raw: &str) -> Result<UserId, ApiResponse> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "user_id is empty"));
    }
    Ok(UserId::new(trimmed))
}

#[tracing::instrument(level = "debug", skip_all, fields(user_id = %user_id))]
async fn get_handover(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResponse {
    let user = match parse_user(&user_id) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    match state.engine.gate().status(&user).await {
        Ok(handover) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "user_id": user,
                "active": handover.is_some(),
                "handover": handover,
                "buffer": state.engine.buffer().status(&user),
            })),
        ),
        Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

#[tracing::instrument(level = "info", skip_all, fields(user_id = %user_id))]
async fn set_handover(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(params): Query<SetHandoverParams>,
) -> ApiResponse {
    let user = match parse_user(&user_id) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let result = match params.minutes {
        Some(0) => return error(StatusCode::BAD_REQUEST, "minutes must be > 0"),
        Some(minutes) => {
            let ttl = Duration::from_secs(minutes.saturating_mul(60));
            state.engine.gate().set(&user, ttl).await
        }
        None => state.engine.gate().engage(&user).await,
    };
    match result {
        Ok(expires_at) => {
            tracing::info!(%expires_at, "handover set by operator");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "status": "ok", "user_id": user, "expires_at": expires_at })),
            )
        }
        Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

#[tracing::instrument(level = "info", skip_all, fields(user_id = %user_id))]
async fn clear_handover(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResponse {
    let user = match parse_user(&user_id) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    match state.engine.gate().clear(&user).await {
        Ok(true) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "not_found" })),
        ),
        Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}
