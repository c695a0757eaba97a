use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use common::metrics;

use crate::handlers::{get_checkout, health, initiate_checkout};
use crate::state::AppState;

/// Prometheus metrics endpoint handler
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.config.mock_kafka {
        return (
            StatusCode::OK,
            String::from("Kafka is mocked, metrics not available."),
        );
    }

    match metrics::gather_metrics() {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(e) => {
            tracing::error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("Failed to gather metrics"),
            )
        }
    }
}

/// Build the application router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/checkout", post(initiate_checkout::handle))
        .route("/api/checkout/:checkout_id", get(get_checkout::handle))
        .with_state(state)
}
