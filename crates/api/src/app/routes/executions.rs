use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use forgeflow_core::ExecutionId;
use forgeflow_infra::StartExecution;

use crate::app::dto::{CancelResponse, CreateExecutionRequest, ExecutionCreated, ReprocessResponse};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub async fn create(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<CreateExecutionRequest>,
) -> Result<Response, ApiError> {
    let execution = services
        .run_blocking(move |s| {
            let version = match body.version {
                Some(version) => version,
                None => s.definitions.get_latest(&body.definition_id)?.version,
            };
            Ok(s.orchestrator.start_execution(StartExecution {
                tenant_id: Some(tenant.tenant_id()),
                definition_id: body.definition_id,
                version,
                context: body.context,
                correlation_id: body.correlation_id,
            })?)
        })
        .await?;

    let created = ExecutionCreated {
        execution_id: execution.id(),
        definition_id: execution.definition_id().clone(),
        definition_version: execution.definition_version(),
        status: execution.status(),
        correlation_id: execution.correlation_id().clone(),
    };
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

pub async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id: ExecutionId = id.parse()?;
    let report = services
        .run_blocking(move |s| Ok(s.orchestrator.get_status(tenant.tenant_id(), id)?))
        .await?;
    Ok(Json(report).into_response())
}

pub async fn cancel(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id: ExecutionId = id.parse()?;
    let cancel_requested = services
        .run_blocking(move |s| Ok(s.orchestrator.cancel(tenant.tenant_id(), id)?))
        .await?;

    let status = if cancel_requested { StatusCode::ACCEPTED } else { StatusCode::OK };
    Ok((status, Json(CancelResponse { execution_id: id, cancel_requested })).into_response())
}

/// Reprocess the latest DLQ entry of an execution.
pub async fn reprocess(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id: ExecutionId = id.parse()?;
    let resumed = services
        .run_blocking(move |s| Ok(s.orchestrator.reprocess_execution(tenant.tenant_id(), id)?))
        .await?;

    let body = ReprocessResponse {
        execution_id: resumed.id(),
        parent_execution_id: resumed.parent_execution_id(),
        status: resumed.status(),
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}
