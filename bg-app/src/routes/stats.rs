use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/stats", get(get_stats))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_stats(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.engine.stats();
    Json(serde_json::json!({
        "admission": stats.admission,
        "dropped_total": stats.admission.dropped_total(),
        "buffer": stats.buffer,
        "sessions": state.sessions.len(),
        "webchat_connections": state.webchat.as_ref().map(|w| w.connected_users()),
    }))
}
