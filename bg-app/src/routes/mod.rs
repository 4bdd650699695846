pub mod handover;
pub mod health;
pub mod messages;
pub mod stats;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(stats::router())
        .merge(handover::router())
        .merge(messages::router())
}
