//! Dead letter queue.
//!
//! Entries are immutable audit records of executions that cannot proceed
//! automatically. Reprocessing never touches an entry; it appends to a
//! separate reprocess log, from which `reprocess_count` is derived.
//!
//! A write reports the firm's depth before and after it, observed under the
//! same lock as the insert, so exactly one write sees a threshold crossed.

pub mod postgres;

pub use postgres::PostgresDeadLetterStore;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use forgeflow_core::{CorrelationId, DeadLetterId, ExecutionId, JobId, TenantId};
use forgeflow_workflow::{ErrorClass, ExecutionStatus, StepId, WorkflowExecution};

/// A frozen execution awaiting manual action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    #[serde(rename = "firm_id")]
    pub tenant_id: TenantId,
    pub execution_id: ExecutionId,
    /// Job whose attempt gave up, if a job was involved.
    pub job_id: Option<JobId>,
    pub step_id: Option<StepId>,
    pub failure_reason: String,
    pub error_class: ErrorClass,
    pub failed_at: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    /// Status the execution was frozen in.
    pub terminal_status: ExecutionStatus,
}

const DEAD_LETTER_NAMESPACE: Uuid = Uuid::from_u128(0x2d8e_51a7_c04b_4f39_9a6e_7c13_b5d2_e840);

impl DeadLetterEntry {
    /// An execution freezes at most once, so its entry id is derived from it.
    pub fn id_for(execution_id: ExecutionId) -> DeadLetterId {
        DeadLetterId::from_uuid(Uuid::new_v5(&DEAD_LETTER_NAMESPACE, execution_id.as_uuid().as_bytes()))
    }

    /// Entry for an execution that was just frozen.
    pub fn for_execution(
        execution: &WorkflowExecution,
        job_id: Option<JobId>,
        error_class: ErrorClass,
    ) -> Self {
        Self {
            id: Self::id_for(execution.id()),
            tenant_id: execution.tenant_id(),
            execution_id: execution.id(),
            job_id,
            step_id: execution.failed_step().cloned(),
            failure_reason: execution
                .failure_reason()
                .unwrap_or("unknown failure")
                .to_string(),
            error_class,
            failed_at: Utc::now(),
            correlation_id: execution.correlation_id().clone(),
            terminal_status: execution.status(),
        }
    }

    /// Only dead-lettered executions can be resumed; a failed compensation
    /// needs an operator.
    pub fn reprocessable(&self) -> bool {
        self.terminal_status == ExecutionStatus::DeadLettered
    }
}

/// One reprocess action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReprocessRecord {
    pub dead_letter_id: DeadLetterId,
    /// The execution created by the reprocess.
    pub new_execution_id: ExecutionId,
    pub reprocessed_at: DateTime<Utc>,
}

/// Listing row: the entry plus its derived reprocess count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterListing {
    #[serde(flatten)]
    pub entry: DeadLetterEntry,
    pub reprocess_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeadLetterError {
    #[error("dead letter entry not found: {0}")]
    NotFound(DeadLetterId),

    #[error("dead letter entry already exists: {0}")]
    AlreadyExists(DeadLetterId),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Firm DLQ depth around one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthChange {
    pub before: usize,
    pub after: usize,
}

impl DepthChange {
    /// This write took the depth from below `threshold` to at least it.
    /// A zero threshold never fires.
    pub fn crossed(&self, threshold: usize) -> bool {
        threshold > 0 && self.before < threshold && self.after >= threshold
    }
}

/// Durable DLQ storage.
pub trait DeadLetterStore: Send + Sync {
    fn write(&self, entry: DeadLetterEntry) -> Result<DepthChange, DeadLetterError>;

    /// Another firm's entry is reported as not found.
    fn get(&self, tenant_id: TenantId, id: DeadLetterId) -> Result<DeadLetterEntry, DeadLetterError>;

    /// Entries of one firm, oldest first.
    fn list(&self, tenant_id: TenantId) -> Result<Vec<DeadLetterListing>, DeadLetterError>;

    fn record_reprocess(&self, tenant_id: TenantId, record: ReprocessRecord) -> Result<(), DeadLetterError>;

    fn reprocess_history(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
    ) -> Result<Vec<ReprocessRecord>, DeadLetterError>;

    /// Entries of one firm that were never reprocessed.
    fn depth(&self, tenant_id: TenantId) -> Result<usize, DeadLetterError>;

    /// Latest entry written for an execution.
    fn find_by_execution(
        &self,
        tenant_id: TenantId,
        execution_id: ExecutionId,
    ) -> Result<Option<DeadLetterEntry>, DeadLetterError>;
}

impl<S> DeadLetterStore for Arc<S>
where
    S: DeadLetterStore + ?Sized,
{
    fn write(&self, entry: DeadLetterEntry) -> Result<DepthChange, DeadLetterError> {
        (**self).write(entry)
    }

    fn get(&self, tenant_id: TenantId, id: DeadLetterId) -> Result<DeadLetterEntry, DeadLetterError> {
        (**self).get(tenant_id, id)
    }

    fn list(&self, tenant_id: TenantId) -> Result<Vec<DeadLetterListing>, DeadLetterError> {
        (**self).list(tenant_id)
    }

    fn record_reprocess(&self, tenant_id: TenantId, record: ReprocessRecord) -> Result<(), DeadLetterError> {
        (**self).record_reprocess(tenant_id, record)
    }

    fn reprocess_history(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
    ) -> Result<Vec<ReprocessRecord>, DeadLetterError> {
        (**self).reprocess_history(tenant_id, id)
    }

    fn depth(&self, tenant_id: TenantId) -> Result<usize, DeadLetterError> {
        (**self).depth(tenant_id)
    }

    fn find_by_execution(
        &self,
        tenant_id: TenantId,
        execution_id: ExecutionId,
    ) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        (**self).find_by_execution(tenant_id, execution_id)
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Append order is listing order.
    entries: Vec<DeadLetterEntry>,
    reprocessed: HashMap<DeadLetterId, Vec<ReprocessRecord>>,
}

impl Inner {
    fn entry(&self, tenant_id: TenantId, id: DeadLetterId) -> Result<&DeadLetterEntry, DeadLetterError> {
        self.entries
            .iter()
            .find(|e| e.id == id && e.tenant_id == tenant_id)
            .ok_or(DeadLetterError::NotFound(id))
    }

    fn reprocess_count(&self, id: DeadLetterId) -> u32 {
        self.reprocessed.get(&id).map(|r| r.len() as u32).unwrap_or(0)
    }

    fn depth(&self, tenant_id: TenantId) -> usize {
        self.entries
            .iter()
            .filter(|e| e.tenant_id == tenant_id && self.reprocess_count(e.id) == 0)
            .count()
    }
}

/// In-memory DLQ.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    inner: RwLock<Inner>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, DeadLetterError> {
        self.inner
            .read()
            .map_err(|_| DeadLetterError::Storage("lock poisoned".to_string()))
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, DeadLetterError> {
        self.inner
            .write()
            .map_err(|_| DeadLetterError::Storage("lock poisoned".to_string()))
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn write(&self, entry: DeadLetterEntry) -> Result<DepthChange, DeadLetterError> {
        let mut inner = self.write_lock()?;
        if inner.entries.iter().any(|e| e.id == entry.id) {
            return Err(DeadLetterError::AlreadyExists(entry.id));
        }
        let tenant_id = entry.tenant_id;
        let before = inner.depth(tenant_id);
        inner.entries.push(entry);
        Ok(DepthChange {
            before,
            after: inner.depth(tenant_id),
        })
    }

    fn get(&self, tenant_id: TenantId, id: DeadLetterId) -> Result<DeadLetterEntry, DeadLetterError> {
        self.read()?.entry(tenant_id, id).cloned()
    }

    fn list(&self, tenant_id: TenantId) -> Result<Vec<DeadLetterListing>, DeadLetterError> {
        let inner = self.read()?;
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .map(|e| DeadLetterListing {
                entry: e.clone(),
                reprocess_count: inner.reprocess_count(e.id),
            })
            .collect())
    }

    fn record_reprocess(&self, tenant_id: TenantId, record: ReprocessRecord) -> Result<(), DeadLetterError> {
        let mut inner = self.write_lock()?;
        inner.entry(tenant_id, record.dead_letter_id)?;
        inner
            .reprocessed
            .entry(record.dead_letter_id)
            .or_default()
            .push(record);
        Ok(())
    }

    fn reprocess_history(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
    ) -> Result<Vec<ReprocessRecord>, DeadLetterError> {
        let inner = self.read()?;
        inner.entry(tenant_id, id)?;
        Ok(inner.reprocessed.get(&id).cloned().unwrap_or_default())
    }

    fn depth(&self, tenant_id: TenantId) -> Result<usize, DeadLetterError> {
        Ok(self.read()?.depth(tenant_id))
    }

    fn find_by_execution(
        &self,
        tenant_id: TenantId,
        execution_id: ExecutionId,
    ) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        let inner = self.read()?;
        Ok(inner
            .entries
            .iter()
            .rev()
            .find(|e| e.tenant_id == tenant_id && e.execution_id == execution_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tenant: TenantId, status: ExecutionStatus) -> DeadLetterEntry {
        DeadLetterEntry {
            id: DeadLetterId::new(),
            tenant_id: tenant,
            execution_id: ExecutionId::new(),
            job_id: Some(JobId::new()),
            step_id: Some(StepId::new("post")),
            failure_reason: "rejected".to_string(),
            error_class: ErrorClass::Permanent,
            failed_at: Utc::now(),
            correlation_id: CorrelationId::generate(),
            terminal_status: status,
        }
    }

    #[test]
    fn listing_is_firm_scoped_and_counts_reprocesses() {
        let dlq = InMemoryDeadLetterStore::new();
        let firm = TenantId::new();
        let mine = entry(firm, ExecutionStatus::DeadLettered);
        dlq.write(mine.clone()).unwrap();
        dlq.write(entry(TenantId::new(), ExecutionStatus::DeadLettered)).unwrap();

        assert_eq!(dlq.depth(firm).unwrap(), 1);
        dlq.record_reprocess(
            firm,
            ReprocessRecord {
                dead_letter_id: mine.id,
                new_execution_id: ExecutionId::new(),
                reprocessed_at: Utc::now(),
            },
        )
        .unwrap();

        let listing = dlq.list(firm).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].reprocess_count, 1);
        // The entry itself is unchanged.
        assert_eq!(listing[0].entry, mine);
        assert_eq!(dlq.depth(firm).unwrap(), 0);
    }

    #[test]
    fn other_firms_cannot_see_or_reprocess_an_entry() {
        let dlq = InMemoryDeadLetterStore::new();
        let e = entry(TenantId::new(), ExecutionStatus::DeadLettered);
        dlq.write(e.clone()).unwrap();

        let stranger = TenantId::new();
        assert_eq!(dlq.get(stranger, e.id), Err(DeadLetterError::NotFound(e.id)));
        assert!(dlq.reprocess_history(stranger, e.id).is_err());
    }

    #[test]
    fn compensation_failures_are_not_reprocessable() {
        assert!(entry(TenantId::new(), ExecutionStatus::DeadLettered).reprocessable());
        assert!(!entry(TenantId::new(), ExecutionStatus::CompensationFailed).reprocessable());
    }

    #[test]
    fn entries_are_written_once() {
        let dlq = InMemoryDeadLetterStore::new();
        let e = entry(TenantId::new(), ExecutionStatus::DeadLettered);
        dlq.write(e.clone()).unwrap();
        assert_eq!(dlq.write(e.clone()), Err(DeadLetterError::AlreadyExists(e.id)));
        assert_eq!(dlq.depth(e.tenant_id).unwrap(), 1);
        assert_eq!(
            dlq.find_by_execution(e.tenant_id, e.execution_id).unwrap(),
            Some(e)
        );
    }

    #[test]
    fn entry_ids_follow_the_execution() {
        let execution = ExecutionId::new();
        assert_eq!(DeadLetterEntry::id_for(execution), DeadLetterEntry::id_for(execution));
        assert_ne!(DeadLetterEntry::id_for(execution), DeadLetterEntry::id_for(ExecutionId::new()));
    }

    #[test]
    fn write_reports_depth_per_firm() {
        let dlq = InMemoryDeadLetterStore::new();
        let firm = TenantId::new();
        let first = entry(firm, ExecutionStatus::DeadLettered);
        assert_eq!(dlq.write(first.clone()).unwrap(), DepthChange { before: 0, after: 1 });
        dlq.write(entry(TenantId::new(), ExecutionStatus::DeadLettered)).unwrap();
        assert_eq!(
            dlq.write(entry(firm, ExecutionStatus::DeadLettered)).unwrap(),
            DepthChange { before: 1, after: 2 }
        );

        // Reprocessed entries no longer count.
        dlq.record_reprocess(
            firm,
            ReprocessRecord {
                dead_letter_id: first.id,
                new_execution_id: ExecutionId::new(),
                reprocessed_at: Utc::now(),
            },
        )
        .unwrap();
        assert_eq!(
            dlq.write(entry(firm, ExecutionStatus::DeadLettered)).unwrap(),
            DepthChange { before: 1, after: 2 }
        );
    }

    #[test]
    fn crossing_needs_both_sides_of_the_threshold() {
        assert!(DepthChange { before: 2, after: 3 }.crossed(3));
        assert!(!DepthChange { before: 3, after: 4 }.crossed(3));
        assert!(!DepthChange { before: 1, after: 2 }.crossed(3));
        assert!(!DepthChange { before: 0, after: 1 }.crossed(0));
    }

    #[test]
    fn concurrent_writes_cross_a_threshold_exactly_once() {
        use std::sync::Barrier;

        let dlq = InMemoryDeadLetterStore::arc();
        let firm = TenantId::new();
        let threshold = 4;
        let writers = 8;
        let barrier = Arc::new(Barrier::new(writers));

        let handles: Vec<_> = (0..writers)
            .map(|_| {
                let dlq = dlq.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    dlq.write(entry(firm, ExecutionStatus::DeadLettered)).unwrap()
                })
            })
            .collect();

        let changes: Vec<DepthChange> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(changes.iter().filter(|c| c.crossed(threshold)).count(), 1);
        assert_eq!(dlq.depth(firm).unwrap(), writers);
    }
}
