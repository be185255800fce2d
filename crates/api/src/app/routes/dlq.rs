use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use forgeflow_core::DeadLetterId;

use crate::app::dto::ReprocessResponse;
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub async fn list(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> Result<Response, ApiError> {
    let entries = services
        .run_blocking(move |s| Ok(s.orchestrator.list_dlq(tenant.tenant_id())?))
        .await?;
    Ok(Json(entries).into_response())
}

pub async fn reprocess(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id: DeadLetterId = id.parse()?;
    let resumed = services
        .run_blocking(move |s| Ok(s.orchestrator.reprocess(tenant.tenant_id(), id)?))
        .await?;

    let body = ReprocessResponse {
        execution_id: resumed.id(),
        parent_execution_id: resumed.parent_execution_id(),
        status: resumed.status(),
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}
