//! Execution persistence: versioned executions, append-only step records and
//! compensation progress.

pub mod postgres;

pub use postgres::PostgresExecutionStore;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use forgeflow_core::{ExecutionId, ExpectedVersion, TenantId};
use forgeflow_workflow::{CompensationRecord, StepExecution, StepId, StepKind, WorkflowExecution};

/// Execution store operation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionStoreError {
    #[error("execution not found: {0}")]
    NotFound(ExecutionId),

    #[error("execution already exists: {0}")]
    AlreadyExists(ExecutionId),

    /// Optimistic concurrency check failed; reload and re-apply.
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// The attempt was already recorded (e.g. a redelivered job reporting twice).
    #[error("attempt {attempt} of {step_id} ({kind:?}) already recorded for {execution_id}")]
    DuplicateAttempt {
        execution_id: ExecutionId,
        step_id: StepId,
        kind: StepKind,
        attempt: u32,
    },

    /// Attempts must be recorded gaplessly starting at 1.
    #[error("attempt {attempt} of {step_id} ({kind:?}) skips ahead of {expected}")]
    AttemptGap {
        step_id: StepId,
        kind: StepKind,
        attempt: u32,
        expected: u32,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable home of workflow executions.
///
/// Every write to an execution states the version it was computed from.
/// `create`/`update`/`commit_step` return the execution stamped with its new
/// version.
pub trait ExecutionStore: Send + Sync {
    fn create(&self, execution: WorkflowExecution) -> Result<WorkflowExecution, ExecutionStoreError>;

    /// Load an execution. Another firm's execution is reported as not found.
    fn get(&self, tenant_id: TenantId, id: ExecutionId) -> Result<WorkflowExecution, ExecutionStoreError>;

    fn update(
        &self,
        execution: WorkflowExecution,
        expected: ExpectedVersion,
    ) -> Result<WorkflowExecution, ExecutionStoreError>;

    /// Append one resolved attempt.
    fn append_step(&self, record: StepExecution) -> Result<(), ExecutionStoreError>;

    /// Update the execution and append `record` as one atomic write.
    ///
    /// Nothing is written when either half is rejected.
    fn commit_step(
        &self,
        execution: WorkflowExecution,
        expected: ExpectedVersion,
        record: Option<StepExecution>,
    ) -> Result<WorkflowExecution, ExecutionStoreError>;

    /// Every recorded attempt of an execution in append order.
    fn steps(&self, tenant_id: TenantId, id: ExecutionId) -> Result<Vec<StepExecution>, ExecutionStoreError>;

    /// Insert or replace the record for `(execution_id, step_id)`.
    fn upsert_compensation(&self, record: CompensationRecord) -> Result<(), ExecutionStoreError>;

    fn compensations(
        &self,
        tenant_id: TenantId,
        id: ExecutionId,
    ) -> Result<Vec<CompensationRecord>, ExecutionStoreError>;
}

impl<S> ExecutionStore for Arc<S>
where
    S: ExecutionStore + ?Sized,
{
    fn create(&self, execution: WorkflowExecution) -> Result<WorkflowExecution, ExecutionStoreError> {
        (**self).create(execution)
    }

    fn get(&self, tenant_id: TenantId, id: ExecutionId) -> Result<WorkflowExecution, ExecutionStoreError> {
        (**self).get(tenant_id, id)
    }

    fn update(
        &self,
        execution: WorkflowExecution,
        expected: ExpectedVersion,
    ) -> Result<WorkflowExecution, ExecutionStoreError> {
        (**self).update(execution, expected)
    }

    fn append_step(&self, record: StepExecution) -> Result<(), ExecutionStoreError> {
        (**self).append_step(record)
    }

    fn commit_step(
        &self,
        execution: WorkflowExecution,
        expected: ExpectedVersion,
        record: Option<StepExecution>,
    ) -> Result<WorkflowExecution, ExecutionStoreError> {
        (**self).commit_step(execution, expected, record)
    }

    fn steps(&self, tenant_id: TenantId, id: ExecutionId) -> Result<Vec<StepExecution>, ExecutionStoreError> {
        (**self).steps(tenant_id, id)
    }

    fn upsert_compensation(&self, record: CompensationRecord) -> Result<(), ExecutionStoreError> {
        (**self).upsert_compensation(record)
    }

    fn compensations(
        &self,
        tenant_id: TenantId,
        id: ExecutionId,
    ) -> Result<Vec<CompensationRecord>, ExecutionStoreError> {
        (**self).compensations(tenant_id, id)
    }
}

#[derive(Debug, Default)]
struct Inner {
    executions: HashMap<ExecutionId, WorkflowExecution>,
    steps: HashMap<ExecutionId, Vec<StepExecution>>,
    compensations: HashMap<ExecutionId, Vec<CompensationRecord>>,
}

impl Inner {
    fn execution(&self, tenant_id: TenantId, id: ExecutionId) -> Result<&WorkflowExecution, ExecutionStoreError> {
        self.executions
            .get(&id)
            .filter(|e| e.tenant_id() == tenant_id)
            .ok_or(ExecutionStoreError::NotFound(id))
    }

    fn check_update(
        &self,
        execution: &WorkflowExecution,
        expected: ExpectedVersion,
    ) -> Result<u64, ExecutionStoreError> {
        let current = self.execution(execution.tenant_id(), execution.id())?;
        if !expected.matches(current.version()) {
            return Err(ExecutionStoreError::Conflict(format!(
                "expected {expected:?}, found {}",
                current.version()
            )));
        }
        Ok(current.version() + 1)
    }

    fn check_append(&self, record: &StepExecution) -> Result<(), ExecutionStoreError> {
        let execution = self
            .executions
            .get(&record.execution_id)
            .ok_or(ExecutionStoreError::NotFound(record.execution_id))?;
        if execution.tenant_id() != record.tenant_id {
            return Err(ExecutionStoreError::TenantIsolation(format!(
                "step record for {} carries another firm id",
                record.execution_id
            )));
        }

        let recorded = self
            .steps
            .get(&record.execution_id)
            .map(|steps| {
                steps
                    .iter()
                    .filter(|s| s.step_id == record.step_id && s.kind == record.kind)
                    .count() as u32
            })
            .unwrap_or(0);
        check_attempt(recorded, record)
    }
}

/// `record` must be the attempt right after the `recorded` ones.
fn check_attempt(recorded: u32, record: &StepExecution) -> Result<(), ExecutionStoreError> {
    if record.attempt <= recorded {
        return Err(ExecutionStoreError::DuplicateAttempt {
            execution_id: record.execution_id,
            step_id: record.step_id.clone(),
            kind: record.kind,
            attempt: record.attempt,
        });
    }
    if record.attempt != recorded + 1 {
        return Err(ExecutionStoreError::AttemptGap {
            step_id: record.step_id.clone(),
            kind: record.kind,
            attempt: record.attempt,
            expected: recorded + 1,
        });
    }
    Ok(())
}

/// In-memory execution store.
///
/// Intended for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    inner: RwLock<Inner>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, ExecutionStoreError> {
        self.inner
            .read()
            .map_err(|_| ExecutionStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, ExecutionStoreError> {
        self.inner
            .write()
            .map_err(|_| ExecutionStoreError::Storage("lock poisoned".to_string()))
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn create(&self, execution: WorkflowExecution) -> Result<WorkflowExecution, ExecutionStoreError> {
        let mut inner = self.write()?;
        if inner.executions.contains_key(&execution.id()) {
            return Err(ExecutionStoreError::AlreadyExists(execution.id()));
        }
        let stored = execution.with_version(1);
        inner.executions.insert(stored.id(), stored.clone());
        Ok(stored)
    }

    fn get(&self, tenant_id: TenantId, id: ExecutionId) -> Result<WorkflowExecution, ExecutionStoreError> {
        self.read()?.execution(tenant_id, id).cloned()
    }

    fn update(
        &self,
        execution: WorkflowExecution,
        expected: ExpectedVersion,
    ) -> Result<WorkflowExecution, ExecutionStoreError> {
        self.commit_step(execution, expected, None)
    }

    fn append_step(&self, record: StepExecution) -> Result<(), ExecutionStoreError> {
        let mut inner = self.write()?;
        inner.check_append(&record)?;
        inner.steps.entry(record.execution_id).or_default().push(record);
        Ok(())
    }

    fn commit_step(
        &self,
        execution: WorkflowExecution,
        expected: ExpectedVersion,
        record: Option<StepExecution>,
    ) -> Result<WorkflowExecution, ExecutionStoreError> {
        let mut inner = self.write()?;
        let next = inner.check_update(&execution, expected)?;
        if let Some(record) = &record {
            if record.execution_id != execution.id() {
                return Err(ExecutionStoreError::Storage(format!(
                    "step record for {} committed with execution {}",
                    record.execution_id,
                    execution.id()
                )));
            }
            inner.check_append(record)?;
        }

        let stored = execution.with_version(next);
        inner.executions.insert(stored.id(), stored.clone());
        if let Some(record) = record {
            inner.steps.entry(record.execution_id).or_default().push(record);
        }
        Ok(stored)
    }

    fn steps(&self, tenant_id: TenantId, id: ExecutionId) -> Result<Vec<StepExecution>, ExecutionStoreError> {
        let inner = self.read()?;
        inner.execution(tenant_id, id)?;
        Ok(inner.steps.get(&id).cloned().unwrap_or_default())
    }

    fn upsert_compensation(&self, record: CompensationRecord) -> Result<(), ExecutionStoreError> {
        let mut inner = self.write()?;
        if !inner.executions.contains_key(&record.execution_id) {
            return Err(ExecutionStoreError::NotFound(record.execution_id));
        }
        let records = inner.compensations.entry(record.execution_id).or_default();
        match records.iter_mut().find(|r| r.step_id == record.step_id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    fn compensations(
        &self,
        tenant_id: TenantId,
        id: ExecutionId,
    ) -> Result<Vec<CompensationRecord>, ExecutionStoreError> {
        let inner = self.read()?;
        inner.execution(tenant_id, id)?;
        Ok(inner.compensations.get(&id).cloned().unwrap_or_default())
    }
}
