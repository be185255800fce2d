//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, invariants,
/// illegal state transitions, conflicts). Infrastructure concerns belong to the
/// error types of the infra boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A state machine was asked to perform a transition it does not allow.
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    /// A request arrived without the mandatory firm id.
    #[error("firm id is required")]
    MissingTenant,

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn illegal_transition(from: impl core::fmt::Debug, to: impl core::fmt::Debug) -> Self {
        Self::IllegalTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}

/// Fail fast when a firm id is absent.
///
/// Boundary request types carry `Option<TenantId>` so that a missing firm id
/// can be rejected explicitly instead of being defaulted.
pub fn require_tenant(tenant_id: Option<crate::TenantId>) -> DomainResult<crate::TenantId> {
    tenant_id.ok_or(DomainError::MissingTenant)
}
