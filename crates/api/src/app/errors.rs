use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use forgeflow_core::DomainError;
use forgeflow_infra::{EngineError, ExecutionStoreError};
use forgeflow_workflow::DefinitionError;

/// Failures of a request handler after the firm guard.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<DomainError> for ApiError {
    fn from(e: DomainError) -> Self {
        ApiError::Engine(e.into())
    }
}

impl From<DefinitionError> for ApiError {
    fn from(e: DefinitionError) -> Self {
        ApiError::Engine(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::Engine(err) => err,
            ApiError::Join(err) => {
                error!(error = %err, "request task failed");
                return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error");
            }
        };
        engine_error_to_response(err)
    }
}

pub fn engine_error_to_response(err: EngineError) -> Response {
    if err.is_not_found() {
        return json_error(StatusCode::NOT_FOUND, "not_found", err.to_string());
    }

    let message = err.to_string();
    match err {
        EngineError::Domain(DomainError::MissingTenant) => {
            json_error(StatusCode::BAD_REQUEST, "missing_firm_id", message)
        }
        EngineError::Domain(DomainError::Validation(_) | DomainError::InvalidId(_)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", message)
        }
        EngineError::Domain(DomainError::Conflict(_) | DomainError::IllegalTransition { .. })
        | EngineError::Executions(ExecutionStoreError::Conflict(_))
        | EngineError::ContentionExhausted(_) => json_error(StatusCode::CONFLICT, "conflict", message),
        EngineError::Domain(DomainError::InvariantViolation(_)) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", message)
        }
        EngineError::Definition(DefinitionError::Unavailable(_)) => {
            error!(error = %message, "definition source unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "definitions_unavailable", message)
        }
        EngineError::Definition(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invalid_definition", message)
        }
        EngineError::NotReprocessable(_) => {
            json_error(StatusCode::CONFLICT, "not_reprocessable", message)
        }
        EngineError::Executions(ExecutionStoreError::TenantIsolation(_)) => {
            json_error(StatusCode::FORBIDDEN, "tenant_isolation", message)
        }
        other => {
            error!(error = %other, "engine error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "engine_error", message)
        }
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
