mod frames;
mod health;
mod metrics;

use crate::server::SharedState;
use axum::{routing::get, Router};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(frames::frame_socket))
        .route("/ws", get(frames::frame_socket))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}
