use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json};
use bg_channels::{HTTP_CHANNEL_ID, InboundMessage, OutboundMessage};
use bg_engine::UserId;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct SendRequest {
    channel: String,
    recipient: String,
    message: String,
    /// Engage the handover gate for the recipient before sending, so the
    /// automated responder stays quiet while the operator talks.
    #[serde(default)]
    take_over: bool,
}

#[derive(Debug, Deserialize)]
struct InboundRequest {
    user_id: String,
    content: String,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/messages/send", post(send_message))
        .route("/api/v1/messages/inbound", post(post_inbound))
        .route("/api/v1/messages/outbox/{recipient_id}", get(drain_outbox))
}

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn error(status: StatusCode, message: impl std::fmt::Display) -> ApiResponse {
    (
        status,
        Json(serde_json::json!({ "status": "error", "error": message.to_string() })),
    )
}

#[tracing::instrument(level = "info", skip_all, fields(channel = %req.channel))]
async fn send_message(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<SendRequest>,
) -> ApiResponse {
    let Some(adapter) = state.channels.get(&req.channel) else {
        return error(StatusCode::NOT_FOUND, "unknown channel");
    };
    if req.message.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "message is empty");
    }

    let mut handover_expires_at = None;
    if req.take_over {
        match state.engine.gate().engage(&UserId::new(req.recipient.as_str())).await {
            Ok(expires_at) => handover_expires_at = Some(expires_at),
            Err(e) => return error(StatusCode::SERVICE_UNAVAILABLE, e),
        }
    }

    if let Err(e) = adapter
        .send(&req.recipient, OutboundMessage::text(req.message))
        .await
    {
        return error(StatusCode::BAD_GATEWAY, format!("{e:#}"));
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "handover_expires_at": handover_expires_at })),
    )
}

#[tracing::instrument(level = "debug", skip_all)]
async fn post_inbound(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<InboundRequest>,
) -> ApiResponse {
    let Some(outbox) = state.outbox.as_ref() else {
        return error(StatusCode::NOT_FOUND, "http channel disabled");
    };
    if req.user_id.trim().is_empty() || req.content.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "user_id and content are required");
    }

    let inbound = InboundMessage::new(HTTP_CHANNEL_ID, req.user_id.trim(), req.content);
    let message_id = inbound.message_id.clone();
    match outbox.submit(inbound).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "queued", "message_id": message_id })),
        ),
        Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")),
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn drain_outbox(
    Extension(state): Extension<Arc<AppState>>,
    Path(recipient_id): Path<String>,
) -> ApiResponse {
    let Some(outbox) = state.outbox.as_ref() else {
        return error(StatusCode::NOT_FOUND, "http channel disabled");
    };
    let messages = outbox.drain(&recipient_id);
    (
        StatusCode::OK,
        Json(serde_json::json!({ "recipient_id": recipient_id, "messages": messages })),
    )
}
