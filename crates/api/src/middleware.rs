use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use forgeflow_core::TenantId;

use crate::app::errors::json_error;
use crate::context::TenantContext;

/// Header carrying the firm id on every firm-scoped request.
pub const FIRM_HEADER: &str = "x-firm-id";

/// Fail-fast firm guard: a missing or malformed firm id is a 400, never a
/// default.
pub async fn tenant_middleware(mut req: Request, next: Next) -> Result<Response, Response> {
    let tenant_id = extract_firm(req.headers())?;
    req.extensions_mut().insert(TenantContext::new(tenant_id));
    Ok(next.run(req).await)
}

fn extract_firm(headers: &HeaderMap) -> Result<TenantId, Response> {
    let missing = || {
        json_error(
            StatusCode::BAD_REQUEST,
            "missing_firm_id",
            format!("{FIRM_HEADER} header is required"),
        )
    };

    let header = headers.get(FIRM_HEADER).ok_or_else(missing)?;
    let value = header
        .to_str()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_firm_id", "firm id is not valid text"))?
        .trim();
    if value.is_empty() {
        return Err(missing());
    }

    value
        .parse()
        .map_err(|e: forgeflow_core::DomainError| json_error(StatusCode::BAD_REQUEST, "invalid_firm_id", e.to_string()))
}
