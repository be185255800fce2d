//! Workflow domain module.
//!
//! This crate contains the orchestration rules implemented purely as
//! deterministic domain logic (no IO, no threads, no storage): workflow
//! definitions and their step graph, retry policies and error
//! classification, the execution state machine, step attempt and
//! compensation records, and the step handler contract.

pub mod compensation;
pub mod definition;
pub mod execution;
pub mod handler;
pub mod idempotency;
pub mod retry;
pub mod step;

mod duration_ms;

pub use compensation::{CompensationRecord, CompensationStatus, compensation_plan};
pub use definition::{
    CompensationSpec, DefinitionError, DefinitionId, DefinitionSource, StepDefinition, StepId,
    Transition, WorkflowDefinition,
};
pub use execution::{CompletedStep, ExecutionStatus, FanOut, WorkflowExecution};
pub use handler::{
    HandlerRegistry, HandlerRegistryBuilder, StepError, StepFailure, StepHandler, StepInvocation,
    StepOutcome, handler_fn,
};
pub use idempotency::IdempotencyKey;
pub use retry::{ErrorClass, ErrorClassifier, RetryPolicy, jittered};
pub use step::{StepExecution, StepKind, StepStatus};
