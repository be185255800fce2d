//! `forgeflow-core`: foundation building blocks shared by every layer.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! typed identifiers, the domain error model, optimistic-concurrency
//! expectations and the workflow context value object.

pub mod context;
pub mod error;
pub mod id;
pub mod value_object;
pub mod version;

pub use context::WorkflowContext;
pub use error::{DomainError, DomainResult, require_tenant};
pub use id::{CorrelationId, DeadLetterId, ExecutionId, JobId, TenantId, WorkerId};
pub use value_object::ValueObject;
pub use version::ExpectedVersion;
