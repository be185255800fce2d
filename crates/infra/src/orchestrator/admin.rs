//! Operator surface: start, inspect, cancel, DLQ listing and reprocess.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use forgeflow_core::{
    CorrelationId, DeadLetterId, ExecutionId, TenantId, WorkflowContext, require_tenant,
};
use forgeflow_events::LifecycleEventKind;
use forgeflow_workflow::{
    CompensationRecord, DefinitionId, StepExecution, StepId, WorkflowExecution,
};

use super::{Orchestrator, event};
use crate::dlq::{DeadLetterError, DeadLetterListing, ReprocessRecord};
use crate::error::EngineError;
use crate::jobs::StepJob;

/// Request to start a workflow for a firm.
///
/// `tenant_id` stays optional so that a missing firm id is rejected
/// explicitly instead of defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecution {
    #[serde(rename = "firm_id")]
    pub tenant_id: Option<TenantId>,
    pub definition_id: DefinitionId,
    pub version: u32,
    #[serde(default)]
    pub context: WorkflowContext,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

/// `get_status` answer: the execution with its full attempt history.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution: WorkflowExecution,
    pub steps: Vec<StepExecution>,
    pub compensations: Vec<CompensationRecord>,
}

impl Orchestrator {
    /// Create a `Pending` execution and enqueue its entry step.
    #[instrument(skip_all, fields(definition_id = %request.definition_id, version = request.version), err)]
    pub fn start_execution(&self, request: StartExecution) -> Result<WorkflowExecution, EngineError> {
        let tenant_id = require_tenant(request.tenant_id)?;
        let definition = self
            .definitions
            .get_definition(&request.definition_id, request.version)?;
        definition.check_references()?;
        self.executor.handlers().check_definition(&definition)?;

        let correlation_id = request.correlation_id.unwrap_or_else(CorrelationId::generate);
        let execution = self.executions.create(WorkflowExecution::create(
            tenant_id,
            &definition,
            request.context,
            correlation_id,
        ))?;

        let entry = StepJob::forward(execution.id(), definition.entry.clone(), 1);
        self.jobs.enqueue(self.job_for(&execution, entry, 0)?)?;

        info!(
            execution_id = %execution.id(),
            firm_id = %tenant_id,
            correlation_id = %execution.correlation_id(),
            "execution created"
        );
        Ok(execution)
    }

    pub fn get_status(&self, tenant_id: TenantId, id: ExecutionId) -> Result<ExecutionReport, EngineError> {
        let execution = self.load(tenant_id, id)?;
        Ok(ExecutionReport {
            steps: self.executions.steps(tenant_id, id)?,
            compensations: self.executions.compensations(tenant_id, id)?,
            execution,
        })
    }

    /// Flag a cooperative cancel.
    ///
    /// Returns `false` when the execution is already compensating or
    /// terminal. The in-flight step always finishes; the execution stops
    /// before the next one.
    #[instrument(skip(self), err)]
    pub fn cancel(&self, tenant_id: TenantId, id: ExecutionId) -> Result<bool, EngineError> {
        let (_, plan) = self.commit(tenant_id, id, |exec, plan| {
            plan.dirty = exec.request_cancel();
            Ok(())
        })?;
        if plan.dirty {
            info!(execution_id = %id, firm_id = %tenant_id, "cancel requested");
        }
        Ok(plan.dirty)
    }

    pub fn list_dlq(&self, tenant_id: TenantId) -> Result<Vec<DeadLetterListing>, EngineError> {
        Ok(self.dead_letters.list(tenant_id)?)
    }

    /// Resume a dead-lettered execution as a new, linked execution.
    ///
    /// The entry and the original execution are left untouched.
    #[instrument(skip(self), err)]
    pub fn reprocess(&self, tenant_id: TenantId, id: DeadLetterId) -> Result<WorkflowExecution, EngineError> {
        let entry = self.dead_letters.get(tenant_id, id).map_err(|e| match e {
            DeadLetterError::NotFound(id) => EngineError::DeadLetterNotFound(id),
            other => other.into(),
        })?;
        if !entry.reprocessable() {
            return Err(EngineError::NotReprocessable(id));
        }

        let original = self.load(tenant_id, entry.execution_id)?;
        let resumed = self.executions.create(WorkflowExecution::resume_from(&original))?;

        let branches: Vec<StepId> = resumed
            .fan_out()
            .map(|f| f.pending.iter().cloned().collect())
            .unwrap_or_default();
        let steps = if branches.is_empty() {
            resumed.current_step_id().cloned().into_iter().collect()
        } else {
            branches
        };
        for step in steps {
            self.jobs
                .enqueue(self.job_for(&resumed, StepJob::forward(resumed.id(), step, 1), 0)?)?;
        }

        self.dead_letters.record_reprocess(
            tenant_id,
            ReprocessRecord {
                dead_letter_id: id,
                new_execution_id: resumed.id(),
                reprocessed_at: Utc::now(),
            },
        )?;

        self.listeners.emit(
            event(&resumed, LifecycleEventKind::ExecutionReprocessed)
                .with_detail(format!("resumed from {}", original.id())),
        );
        info!(
            dead_letter_id = %id,
            parent_execution_id = %original.id(),
            execution_id = %resumed.id(),
            "dead-lettered execution reprocessed"
        );
        Ok(resumed)
    }

    /// `reprocess` addressed by execution id (latest DLQ entry of that execution).
    pub fn reprocess_execution(
        &self,
        tenant_id: TenantId,
        execution_id: ExecutionId,
    ) -> Result<WorkflowExecution, EngineError> {
        match self.dead_letters.find_by_execution(tenant_id, execution_id)? {
            Some(entry) => self.reprocess(tenant_id, entry.id),
            None => Err(EngineError::ExecutionNotFound(execution_id)),
        }
    }
}
