//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: engine wiring (stores, orchestrator, worker pool)
//! - `routes/`: HTTP handlers, one file per resource
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: engine error to HTTP status mapping

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    // Firm-scoped routes: every request carries `x-firm-id`.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn(middleware::tenant_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .layer(Extension(services))
        .merge(protected)
        .layer(ServiceBuilder::new())
}

pub use services::{AppServices, EngineStores};
