//! Engine-level error.

use thiserror::Error;

use forgeflow_core::{DeadLetterId, DomainError, ExecutionId};
use forgeflow_workflow::DefinitionError;

use crate::dlq::DeadLetterError;
use crate::executions::ExecutionStoreError;
use crate::jobs::JobStoreError;

/// Errors surfaced by the orchestrator, the worker processor and the admin
/// operations.
///
/// Handler failures are never reported here; they become step records.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("job store: {0}")]
    Jobs(#[from] JobStoreError),

    #[error("execution store: {0}")]
    Executions(#[from] ExecutionStoreError),

    #[error("dead letter queue: {0}")]
    DeadLetters(#[from] DeadLetterError),

    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("dead letter entry not found: {0}")]
    DeadLetterNotFound(DeadLetterId),

    /// Only dead-lettered executions can be resumed automatically.
    #[error("dead letter entry {0} cannot be reprocessed")]
    NotReprocessable(DeadLetterId),

    /// Concurrent writers kept invalidating the execution version.
    #[error("gave up updating execution {0} after repeated version conflicts")]
    ContentionExhausted(ExecutionId),
}

impl EngineError {
    /// Missing resources, normalised across stores.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::ExecutionNotFound(_)
                | EngineError::DeadLetterNotFound(_)
                | EngineError::Executions(ExecutionStoreError::NotFound(_))
                | EngineError::DeadLetters(DeadLetterError::NotFound(_))
                | EngineError::Definition(DefinitionError::NotFound { .. })
                | EngineError::Domain(DomainError::NotFound)
        )
    }
}
