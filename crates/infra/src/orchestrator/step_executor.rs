//! Step executor: one handler invocation turned into one step record.
//!
//! Nothing a handler does (failure, panic, missing registration) escapes
//! this boundary as an error; it all becomes a `StepExecution` with an
//! `ErrorClass`.

use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::Utc;
use tracing::{debug, instrument, warn};

use forgeflow_core::WorkflowContext;
use forgeflow_workflow::{
    ErrorClass, ErrorClassifier, HandlerRegistry, IdempotencyKey, StepError, StepExecution, StepId,
    StepInvocation, StepKind, StepOutcome, StepStatus, WorkflowExecution,
};

/// What to run.
#[derive(Debug, Clone, Copy)]
pub struct StepRequest<'a> {
    pub execution: &'a WorkflowExecution,
    pub step_id: &'a StepId,
    pub kind: StepKind,
    pub attempt: u32,
    /// Handler type (forward or compensation).
    pub step_type: &'a str,
    pub classifier: &'a ErrorClassifier,
}

impl StepRequest<'_> {
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::derive(self.execution.id(), self.step_id, self.kind, self.attempt)
    }
}

#[derive(Debug, Clone)]
pub struct StepExecutor {
    handlers: HandlerRegistry,
}

impl StepExecutor {
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self { handlers }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Invoke the handler and record the resolved attempt.
    #[instrument(skip_all, fields(step_id = %req.step_id, kind = ?req.kind, attempt = req.attempt))]
    pub fn run(&self, req: StepRequest<'_>) -> StepExecution {
        let key = req.idempotency_key();
        let started_at = Utc::now();

        let Some(handler) = self.handlers.resolve(req.step_type) else {
            warn!(step_type = req.step_type, "no handler registered");
            return record(
                &req,
                key,
                started_at,
                Err((
                    StepError::new("handler_not_found", format!("no handler for '{}'", req.step_type)),
                    ErrorClass::Permanent,
                )),
            );
        };

        let execution = req.execution;
        let invocation = StepInvocation {
            tenant_id: execution.tenant_id(),
            execution_id: execution.id(),
            correlation_id: execution.correlation_id(),
            step_id: req.step_id,
            kind: req.kind,
            attempt: req.attempt,
            context: execution.context(),
        };

        let result = match catch_unwind(AssertUnwindSafe(|| handler.handle(&invocation, &key))) {
            Ok(StepOutcome::Success { output }) => Ok(output),
            Ok(StepOutcome::Failure(failure)) => {
                let class = req.classifier.classify(&failure);
                Err((failure.error, class))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(panic = %message, "step handler panicked");
                Err((StepError::new("handler_panic", message), ErrorClass::System))
            }
        };

        let record = record(&req, key, started_at, result);
        debug!(status = ?record.status, latency_ms = record.latency_ms(), "step attempt resolved");
        record
    }

    /// Fail an attempt whose job was redelivered too often, without invoking
    /// the handler.
    pub fn undeliverable(&self, req: StepRequest<'_>, deliveries: u32) -> StepExecution {
        self.reject(
            req,
            StepError::new(
                "delivery_budget_exhausted",
                format!("attempt delivered {deliveries} times without completing"),
            ),
            ErrorClass::System,
        )
    }

    /// Record a failed attempt without invoking any handler.
    pub fn reject(&self, req: StepRequest<'_>, error: StepError, class: ErrorClass) -> StepExecution {
        record(&req, req.idempotency_key(), Utc::now(), Err((error, class)))
    }
}

fn record(
    req: &StepRequest<'_>,
    key: IdempotencyKey,
    started_at: chrono::DateTime<Utc>,
    result: Result<WorkflowContext, (StepError, ErrorClass)>,
) -> StepExecution {
    let (status, output, error, error_class) = match result {
        Ok(output) => (StepStatus::Succeeded, Some(output), None, None),
        Err((error, class)) => (StepStatus::Failed, None, Some(error), Some(class)),
    };
    StepExecution {
        execution_id: req.execution.id(),
        tenant_id: req.execution.tenant_id(),
        step_id: req.step_id.clone(),
        kind: req.kind,
        attempt: req.attempt,
        status,
        idempotency_key: key,
        started_at,
        completed_at: Utc::now(),
        output,
        error,
        error_class,
        next_retry_at: None,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
