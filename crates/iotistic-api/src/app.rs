use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        // State
        .route("/v1/state", get(handlers::get_state))
        .route("/v1/state/target", post(handlers::put_target))
        .route("/v1/state/apply", post(handlers::post_apply))
        // Logs
        .route("/v1/logs", get(handlers::get_logs))
        // Containers
        .route("/v1/containers/:id/exec", post(handlers::post_exec))
        // Identity
        .route("/v1/device", get(handlers::get_device))
        .route("/v1/device/provision", post(handlers::post_provision))
        .route("/v1/device/reset", post(handlers::post_reset))
        // Metrics
        .route("/v1/metrics", get(handlers::get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
