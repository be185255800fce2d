//! Step handler contract and the startup-resolved handler registry.
//!
//! Business rules (pricing, recurrence, postings) live behind this contract.
//! Handlers are looked up by `step_type`; the registry is frozen once built so
//! that a definition can be checked against it before any execution starts.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use forgeflow_core::{CorrelationId, ExecutionId, TenantId, WorkflowContext};

use crate::definition::{DefinitionError, StepId, WorkflowDefinition};
use crate::idempotency::IdempotencyKey;
use crate::step::StepKind;

/// Structured error reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
}

impl StepError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl core::fmt::Display for StepError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A failed invocation as reported by the handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub retryable: bool,
    pub error: StepError,
}

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Output fields are merged into the execution context.
    Success { output: WorkflowContext },
    Failure(StepFailure),
}

impl StepOutcome {
    pub fn success() -> Self {
        Self::Success {
            output: WorkflowContext::new(),
        }
    }

    pub fn success_with(output: WorkflowContext) -> Self {
        Self::Success { output }
    }

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure(StepFailure {
            retryable: true,
            error: StepError::new(code, message),
        })
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure(StepFailure {
            retryable: false,
            error: StepError::new(code, message),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success { .. })
    }
}

/// Everything a handler may read about the invocation.
#[derive(Debug, Clone, Copy)]
pub struct StepInvocation<'a> {
    pub tenant_id: TenantId,
    pub execution_id: ExecutionId,
    pub correlation_id: &'a CorrelationId,
    pub step_id: &'a StepId,
    pub kind: StepKind,
    pub attempt: u32,
    pub context: &'a WorkflowContext,
}

/// Step handler contract: `handler(context, idempotency_key) -> outcome`.
///
/// The same attempt may be delivered more than once (crash recovery), so
/// implementations must dedupe side effects on `key`.
pub trait StepHandler: Send + Sync {
    fn handle(&self, invocation: &StepInvocation<'_>, key: &IdempotencyKey) -> StepOutcome;
}

impl<F> StepHandler for F
where
    F: Fn(&StepInvocation<'_>, &IdempotencyKey) -> StepOutcome + Send + Sync,
{
    fn handle(&self, invocation: &StepInvocation<'_>, key: &IdempotencyKey) -> StepOutcome {
        self(invocation, key)
    }
}

/// Pin a closure to the handler signature so its reference arguments are
/// inferred as higher-ranked.
pub fn handler_fn<F>(f: F) -> F
where
    F: Fn(&StepInvocation<'_>, &IdempotencyKey) -> StepOutcome + Send + Sync,
{
    f
}

/// Collects handlers before the engine starts.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register<H>(mut self, step_type: impl Into<String>, handler: H) -> Self
    where
        H: StepHandler + 'static,
    {
        self.handlers.insert(step_type.into(), Arc::new(handler));
        self
    }

    pub fn register_arc(mut self, step_type: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(step_type.into(), handler);
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Frozen `step_type -> handler` table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Arc<dyn StepHandler>>>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("step_types", &types).finish()
    }
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn resolve(&self, step_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }

    /// Reject definitions that reference unregistered step types.
    pub fn check_definition(&self, definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
        match definition.step_types().into_iter().find(|t| !self.contains(t)) {
            Some(missing) => Err(DefinitionError::UnknownStepType(missing.to_string())),
            None => Ok(()),
        }
    }
}
