use axum::{
    Router,
    routing::{get, post},
};

pub mod dlq;
pub mod executions;
pub mod system;

/// Router for all firm-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/executions", post(executions::create))
        .route("/executions/:id", get(executions::status))
        .route("/executions/:id/cancel", post(executions::cancel))
        .route("/executions/:id/reprocess", post(executions::reprocess))
        .route("/dlq", get(dlq::list))
        .route("/dlq/:id/reprocess", post(dlq::reprocess))
}
