use std::sync::Arc;

use axum::{Json, extract::Extension};

use crate::app::services::{AppServices, Health};

/// Liveness plus worker and lifecycle counters. Not firm-scoped.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> Json<Health> {
    Json(services.health())
}
