//! Compensation engine: undo completed steps in reverse completion order.
//!
//! Only one compensation is in flight per execution: the head of the
//! execution's compensation queue. Each one gets the same retry and
//! idempotency treatment as a forward step; giving up is terminal
//! (`CompensationFailed`) and always lands in the DLQ.

use chrono::Utc;
use tracing::{debug, error, warn};

use forgeflow_events::LifecycleEventKind;
use forgeflow_workflow::{
    CompensationRecord, CompensationSpec, CompensationStatus, ErrorClass, ErrorClassifier,
    ExecutionStatus, StepError, StepExecution, StepId, StepKind, WorkflowExecution,
};

use super::{Orchestrator, Plan, StepRequest, resolved_event, step_event};
use crate::dlq::DeadLetterEntry;
use crate::error::EngineError;
use crate::jobs::{ClaimedJob, Disposition, Job, StepJob};

/// The job's step is the compensation currently due.
fn is_due(exec: &WorkflowExecution, step: &StepId) -> bool {
    exec.status() == ExecutionStatus::Compensating && exec.next_compensation() == Some(step)
}

impl Orchestrator {
    pub(super) fn process_compensation(&self, claimed: &ClaimedJob) -> Result<Disposition, EngineError> {
        let job = &claimed.job;
        let payload = &job.payload;

        let execution = self.load(job.tenant_id, payload.execution_id)?;
        if !is_due(&execution, &payload.step_id) {
            debug!(status = execution.status().as_str(), "compensation is not due; dropping job");
            return Ok(Disposition::Skipped);
        }

        let definition = self.definition_of(&execution)?;
        let spec = definition
            .step(&payload.step_id)
            .and_then(|s| s.compensation.clone());

        self.emit_now(&execution, LifecycleEventKind::CompensationAttempted, job);

        let record = match &spec {
            Some(spec) => {
                let request = StepRequest {
                    execution: &execution,
                    step_id: &payload.step_id,
                    kind: StepKind::Compensation,
                    attempt: payload.attempt,
                    step_type: &spec.step_type,
                    classifier: &spec.retry.classifier,
                };
                if job.attempt_count > self.settings.max_deliveries {
                    warn!(deliveries = job.attempt_count, "delivery budget exhausted; failing compensation attempt");
                    self.executor.undeliverable(request, job.attempt_count)
                } else {
                    self.executor.run(request)
                }
            }
            None => self.executor.reject(
                StepRequest {
                    execution: &execution,
                    step_id: &payload.step_id,
                    kind: StepKind::Compensation,
                    attempt: payload.attempt,
                    step_type: "",
                    classifier: &ErrorClassifier::NeverRetry,
                },
                StepError::new(
                    "compensation_not_declared",
                    format!("step {} declares no compensation", payload.step_id),
                ),
                ErrorClass::Permanent,
            ),
        };

        let (_, plan) = self.commit(job.tenant_id, payload.execution_id, |exec, plan| {
            self.resolve_compensation(exec, plan, spec.as_ref(), job, record.clone())
        })?;
        self.publish(plan)
    }

    fn resolve_compensation(
        &self,
        exec: &mut WorkflowExecution,
        plan: &mut Plan,
        spec: Option<&CompensationSpec>,
        job: &Job,
        mut record: StepExecution,
    ) -> Result<(), EngineError> {
        let step = job.payload.step_id.clone();
        if !is_due(exec, &step) {
            return Ok(());
        }

        if record.is_success() {
            exec.compensation_succeeded(&step);
            plan.dirty = true;
            plan.push(step_event(exec, LifecycleEventKind::StepSucceeded, &record).with_detail("compensation"));
            plan.compensations.push(
                CompensationRecord::pending(exec.id(), step.clone())
                    .resolved(CompensationStatus::Succeeded, record.attempt),
            );
            plan.record = Some(record);
            plan.disposition = Disposition::Completed;

            match exec.next_compensation().cloned() {
                Some(next) => {
                    plan.jobs.push(self.job_for(exec, StepJob::compensation(exec.id(), next.clone(), 1), job.priority)?);
                    plan.compensations.push(CompensationRecord::pending(exec.id(), next));
                }
                None => self.maybe_finish_compensation(exec, plan, &step, job.payload.attempt)?,
            }
            return Ok(());
        }

        let class = record.error_class.unwrap_or(ErrorClass::System);
        plan.push(step_event(exec, LifecycleEventKind::StepFailed, &record));
        plan.disposition = Disposition::Failed;

        if let Some(spec) = spec {
            if class.is_retryable() && spec.retry.should_retry(record.attempt) {
                let (next, at) = self.retry.next_attempt(job, &spec.retry, Utc::now())?;
                warn!(
                    execution_id = %exec.id(),
                    correlation_id = %exec.correlation_id(),
                    step_id = %step,
                    attempt = record.attempt,
                    retry_at = %at,
                    "compensation failed; retry scheduled"
                );
                record.next_retry_at = Some(at);
                plan.record = Some(record);
                plan.jobs.push(next);
                return Ok(());
            }
        }

        let reason = match &record.error {
            Some(e) => format!("compensation of {step} failed: {e}"),
            None => format!("compensation of {step} failed"),
        };
        plan.compensations.push(
            CompensationRecord::pending(exec.id(), step.clone())
                .resolved(CompensationStatus::Failed, record.attempt),
        );
        plan.record = Some(record);

        exec.compensation_failed(reason.clone())?;
        plan.dirty = true;

        let mut entry = DeadLetterEntry::for_execution(exec, Some(job.id), ErrorClass::Compensation);
        entry.step_id = Some(step.clone());
        plan.dead_letter = Some(entry);
        plan.push(
            resolved_event(exec, LifecycleEventKind::ExecutionCompensationFailed, &step, job.payload.attempt)
                .with_detail(reason.clone()),
        );
        plan.disposition = Disposition::DeadLettered;

        error!(
            execution_id = %exec.id(),
            firm_id = %exec.tenant_id(),
            correlation_id = %exec.correlation_id(),
            step_id = %step,
            %reason,
            "compensation failed; operator action required"
        );
        Ok(())
    }
}
