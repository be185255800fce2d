//! Follow-up recovery.
//!
//! Follow-ups are published after the execution write commits. When
//! publishing fails the job is left for lease expiry; its redelivery then
//! finds the attempt already applied and is skipped. Before acking a skipped
//! job the orchestrator re-derives what the stored execution is waiting on
//! and publishes it again. Job and DLQ ids are derived from the attempt and
//! the execution, so anything that already exists is left alone.

use tracing::{debug, warn};

use forgeflow_core::{ExecutionId, TenantId};
use forgeflow_workflow::{
    CompensationRecord, ErrorClass, ExecutionStatus, StepExecution, StepId, StepKind,
    WorkflowExecution,
};

use super::Orchestrator;
use crate::dlq::DeadLetterEntry;
use crate::error::EngineError;
use crate::jobs::StepJob;

/// Latest recorded attempt of `step` as `kind`.
fn latest<'a>(records: &'a [StepExecution], step: &StepId, kind: StepKind) -> Option<&'a StepExecution> {
    records
        .iter()
        .filter(|r| &r.step_id == step && r.kind == kind)
        .max_by_key(|r| r.attempt)
}

/// Latest failed attempt of any step as `kind`.
fn latest_failure(records: &[StepExecution], kind: StepKind) -> Option<&StepExecution> {
    records
        .iter()
        .filter(|r| r.kind == kind && !r.is_success())
        .max_by_key(|r| r.completed_at)
}

impl Orchestrator {
    pub(super) fn recover_follow_ups(
        &self,
        tenant_id: TenantId,
        id: ExecutionId,
        priority: i32,
    ) -> Result<(), EngineError> {
        let exec = self.load(tenant_id, id)?;
        match exec.status() {
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                let due: Vec<StepId> = match exec.fan_out() {
                    Some(fan_out) => fan_out.pending.iter().cloned().collect(),
                    None => exec.current_step_id().cloned().into_iter().collect(),
                };
                if due.is_empty() {
                    return Ok(());
                }
                let records = self.executions.steps(tenant_id, id)?;
                for step in due {
                    self.requeue(&exec, &records, step, StepKind::Forward, priority)?;
                }
            }
            ExecutionStatus::Compensating => {
                let Some(step) = exec.next_compensation().cloned() else {
                    return Ok(());
                };
                let records = self.executions.steps(tenant_id, id)?;
                if latest(&records, &step, StepKind::Compensation).is_none() {
                    self.executions
                        .upsert_compensation(CompensationRecord::pending(id, step.clone()))?;
                }
                self.requeue(&exec, &records, step, StepKind::Compensation, priority)?;
            }
            ExecutionStatus::DeadLettered | ExecutionStatus::CompensationFailed => {
                self.restore_dead_letter(&exec)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Enqueue the attempt of `step` that follows the recorded ones.
    fn requeue(
        &self,
        exec: &WorkflowExecution,
        records: &[StepExecution],
        step: StepId,
        kind: StepKind,
        priority: i32,
    ) -> Result<(), EngineError> {
        let last = latest(records, &step, kind);
        let attempt = last.map_or(1, |r| r.attempt + 1);
        let payload = match kind {
            StepKind::Forward => StepJob::forward(exec.id(), step, attempt),
            StepKind::Compensation => StepJob::compensation(exec.id(), step, attempt),
        };
        let mut job = self.job_for(exec, payload, priority)?;
        if let Some(at) = last.and_then(|r| r.next_retry_at) {
            job = job.available_at(at);
        }
        debug!(job_id = %job.id, attempt, "re-publishing follow-up");
        self.enqueue(job)
    }

    fn restore_dead_letter(&self, exec: &WorkflowExecution) -> Result<(), EngineError> {
        if self
            .dead_letters
            .find_by_execution(exec.tenant_id(), exec.id())?
            .is_some()
        {
            return Ok(());
        }
        let records = self.executions.steps(exec.tenant_id(), exec.id())?;
        let entry = match exec.status() {
            ExecutionStatus::CompensationFailed => {
                let mut entry = DeadLetterEntry::for_execution(exec, None, ErrorClass::Compensation);
                if let Some(failed) = latest_failure(&records, StepKind::Compensation) {
                    entry.step_id = Some(failed.step_id.clone());
                }
                entry
            }
            _ => {
                let class = latest_failure(&records, StepKind::Forward)
                    .and_then(|r| r.error_class)
                    .unwrap_or(ErrorClass::Permanent);
                DeadLetterEntry::for_execution(exec, None, class)
            }
        };
        warn!(
            execution_id = %exec.id(),
            firm_id = %exec.tenant_id(),
            correlation_id = %exec.correlation_id(),
            "dead letter entry missing for frozen execution; writing it"
        );
        self.write_dead_letter(entry)
    }
}
