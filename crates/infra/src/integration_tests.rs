//! End-to-end tests for the engine.
//!
//! Pipeline: start_execution → JobStore → WorkerPool → Orchestrator →
//! ExecutionStore / DeadLetterStore / listeners
//!
//! Verifies:
//! - Each job is held by one worker at a time and every step runs once
//! - Failures follow the retry, compensation and DLQ paths
//! - Crashed or stalled workers lose their jobs to other workers
//! - Cancellation is cooperative
//! - Firm isolation holds on every admin operation

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use chrono::{DateTime, Utc};

    use forgeflow_core::{DeadLetterId, ExecutionId, JobId, TenantId, WorkerId, WorkflowContext};
    use forgeflow_events::{LifecycleEventKind, RecordingListener};
    use forgeflow_workflow::{
        CompensationSpec, CompensationStatus, DefinitionId, ErrorClass, ExecutionStatus,
        HandlerRegistry, IdempotencyKey, RetryPolicy, StepDefinition, StepInvocation, StepKind,
        StepOutcome, StepStatus, WorkflowDefinition, handler_fn,
    };

    use crate::definitions::InMemoryDefinitionSource;
    use crate::dlq::{
        DeadLetterEntry, DeadLetterError, DeadLetterListing, DeadLetterStore, DepthChange,
        InMemoryDeadLetterStore, ReprocessRecord,
    };
    use crate::error::EngineError;
    use crate::executions::{ExecutionStore, InMemoryExecutionStore};
    use crate::idempotency::{DedupingHandler, InMemoryProcessedKeyStore};
    use crate::jobs::{
        ClaimToken, ClaimedJob, InMemoryJobStore, Job, JobStore, JobStoreError, StepJob, WorkerPool,
        WorkerPoolConfig, WorkerPoolHandle,
    };
    use crate::orchestrator::{ExecutionReport, Orchestrator, OrchestratorBuilder, StartExecution};
    use crate::retry::{NoJitter, RetryScheduler};

    const QUEUE: &str = "workflow-steps";

    struct Harness {
        tenant: TenantId,
        orchestrator: Arc<Orchestrator>,
        jobs: Arc<InMemoryJobStore>,
        executions: Arc<InMemoryExecutionStore>,
        events: Arc<RecordingListener>,
        pool: Option<WorkerPoolHandle>,
    }

    impl Harness {
        fn new(definition: WorkflowDefinition, handlers: HandlerRegistry) -> Self {
            Self::configured(definition, handlers, |b| b)
        }

        fn configured(
            definition: WorkflowDefinition,
            handlers: HandlerRegistry,
            configure: impl FnOnce(OrchestratorBuilder) -> OrchestratorBuilder,
        ) -> Self {
            Self::wired(definition, handlers, |jobs| jobs, InMemoryDeadLetterStore::arc(), configure)
        }

        /// The orchestrator publishes through `publish_jobs(jobs)` and writes
        /// to `dead_letters`; workers claim straight from the in-memory store.
        fn wired(
            definition: WorkflowDefinition,
            handlers: HandlerRegistry,
            publish_jobs: impl FnOnce(Arc<dyn JobStore>) -> Arc<dyn JobStore>,
            dead_letters: Arc<dyn DeadLetterStore>,
            configure: impl FnOnce(OrchestratorBuilder) -> OrchestratorBuilder,
        ) -> Self {
            let jobs = InMemoryJobStore::arc();
            let executions = InMemoryExecutionStore::arc();
            let definitions = InMemoryDefinitionSource::arc();
            definitions.register(definition).expect("register definition");
            let events = Arc::new(RecordingListener::new());

            let builder = Orchestrator::builder(
                publish_jobs(jobs.clone()),
                executions.clone(),
                dead_letters,
                definitions,
                handlers,
            )
            .retry_scheduler(RetryScheduler::new(0.0).with_jitter(NoJitter))
            .listener(events.clone());

            Self {
                tenant: TenantId::new(),
                orchestrator: Arc::new(configure(builder).build()),
                jobs,
                executions,
                events,
                pool: None,
            }
        }

        fn run(self, workers: usize) -> Self {
            self.run_with(pool_config(workers))
        }

        fn run_with(mut self, config: WorkerPoolConfig) -> Self {
            let pool = WorkerPool::spawn(self.jobs.clone(), self.orchestrator.clone(), config)
                .expect("spawn worker pool");
            self.pool = Some(pool);
            self
        }

        fn start(&self, definition_id: &str, context: WorkflowContext) -> ExecutionId {
            self.orchestrator
                .start_execution(StartExecution {
                    tenant_id: Some(self.tenant),
                    definition_id: DefinitionId::new(definition_id),
                    version: 1,
                    context,
                    correlation_id: None,
                })
                .expect("start execution")
                .id()
        }

        fn report(&self, id: ExecutionId) -> ExecutionReport {
            self.orchestrator.get_status(self.tenant, id).expect("get status")
        }

        fn settle(&self, id: ExecutionId) -> ExecutionReport {
            wait_until("execution to reach a terminal status", || {
                let report = self.report(id);
                report.execution.is_terminal().then_some(report)
            })
        }

        /// Settle, then stop the pool so that everything published after the
        /// final commit (DLQ entries, compensation records, events) is visible.
        fn finish(&mut self, id: ExecutionId) -> ExecutionReport {
            self.settle(id);
            self.stop();
            self.report(id)
        }

        /// Stop the workers; in-flight jobs finish first.
        fn stop(&mut self) {
            if let Some(pool) = self.pool.take() {
                pool.shutdown();
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn pool_config(workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_name("it")
            .with_queue(QUEUE)
            .with_workers(workers)
            .with_poll_interval(Duration::from_millis(2))
            .with_max_idle_backoff(Duration::from_millis(10))
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(5), Duration::from_millis(20))
    }

    fn wait_until<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(value) = check() {
                return value;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Job store whose `fail_on`-th enqueue (0-based) fails once.
    struct FailingEnqueue {
        inner: Arc<dyn JobStore>,
        calls: AtomicU32,
        fail_on: u32,
    }

    impl JobStore for FailingEnqueue {
        fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_on {
                return Err(JobStoreError::Storage("connection reset".to_string()));
            }
            self.inner.enqueue(job)
        }

        fn claim(
            &self,
            worker: &WorkerId,
            queue: &str,
            batch_size: usize,
            lease: Duration,
        ) -> Result<Vec<ClaimedJob>, JobStoreError> {
            self.inner.claim(worker, queue, batch_size, lease)
        }

        fn ack(&self, job_id: JobId, token: ClaimToken) -> Result<(), JobStoreError> {
            self.inner.ack(job_id, token)
        }

        fn nack(&self, job_id: JobId, token: ClaimToken, retry_after: Duration) -> Result<(), JobStoreError> {
            self.inner.nack(job_id, token, retry_after)
        }

        fn extend_lease(
            &self,
            job_id: JobId,
            token: ClaimToken,
            lease: Duration,
        ) -> Result<DateTime<Utc>, JobStoreError> {
            self.inner.extend_lease(job_id, token, lease)
        }

        fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(job_id)
        }

        fn depth(&self, queue: &str) -> Result<usize, JobStoreError> {
            self.inner.depth(queue)
        }
    }

    /// DLQ that can hold writers at a barrier and fail the first write.
    #[derive(Default)]
    struct GatedDeadLetters {
        inner: InMemoryDeadLetterStore,
        gate: Option<Barrier>,
        fail_first: AtomicBool,
    }

    impl DeadLetterStore for GatedDeadLetters {
        fn write(&self, entry: DeadLetterEntry) -> Result<DepthChange, DeadLetterError> {
            if let Some(gate) = &self.gate {
                gate.wait();
            }
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(DeadLetterError::Storage("connection reset".to_string()));
            }
            self.inner.write(entry)
        }

        fn get(&self, tenant_id: TenantId, id: DeadLetterId) -> Result<DeadLetterEntry, DeadLetterError> {
            self.inner.get(tenant_id, id)
        }

        fn list(&self, tenant_id: TenantId) -> Result<Vec<DeadLetterListing>, DeadLetterError> {
            self.inner.list(tenant_id)
        }

        fn record_reprocess(&self, tenant_id: TenantId, record: ReprocessRecord) -> Result<(), DeadLetterError> {
            self.inner.record_reprocess(tenant_id, record)
        }

        fn reprocess_history(
            &self,
            tenant_id: TenantId,
            id: DeadLetterId,
        ) -> Result<Vec<ReprocessRecord>, DeadLetterError> {
            self.inner.reprocess_history(tenant_id, id)
        }

        fn depth(&self, tenant_id: TenantId) -> Result<usize, DeadLetterError> {
            self.inner.depth(tenant_id)
        }

        fn find_by_execution(
            &self,
            tenant_id: TenantId,
            execution_id: ExecutionId,
        ) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
            self.inner.find_by_execution(tenant_id, execution_id)
        }
    }

    /// Short leases so a job whose processing errored comes back quickly.
    fn redelivering_pool(workers: usize) -> WorkerPoolConfig {
        pool_config(workers)
            .with_lease(Duration::from_millis(60))
            .with_heartbeat_interval(Duration::from_millis(20))
    }

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    fn counting(
        calls: &Arc<AtomicU32>,
    ) -> impl Fn(&StepInvocation<'_>, &IdempotencyKey) -> StepOutcome + Send + Sync + 'static {
        let calls = calls.clone();
        handler_fn(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            StepOutcome::success()
        })
    }

    #[test]
    fn sequential_workflow_completes_and_merges_outputs() {
        let definition = WorkflowDefinition::new("invoice", 1, "price")
            .with_step(StepDefinition::new("price", "pricing.evaluate").then("post"))
            .with_step(StepDefinition::new("post", "billing.post").then("notify"))
            .with_step(StepDefinition::new("notify", "mail.send"));

        let handlers = HandlerRegistry::builder()
            .register(
                "pricing.evaluate",
                handler_fn(|inv, _| {
                    let hours = inv.context.get("hours").and_then(|v| v.as_i64()).unwrap_or(0);
                    StepOutcome::success_with(WorkflowContext::new().with("amount", json!(hours * 150)))
                }),
            )
            .register(
                "billing.post",
                handler_fn(|inv, _| {
                    assert_eq!(inv.context.get("amount"), Some(&json!(600)));
                    StepOutcome::success_with(WorkflowContext::new().with("invoice_no", json!("INV-1")))
                }),
            )
            .register("mail.send", handler_fn(|_, _| StepOutcome::success()))
            .build();

        let mut harness = Harness::new(definition, handlers).run(2);
        let id = harness.start("invoice", WorkflowContext::new().with("hours", json!(4)));

        let report = harness.settle(id);
        assert_eq!(report.execution.status(), ExecutionStatus::Completed);
        assert_eq!(report.execution.context().get("invoice_no"), Some(&json!("INV-1")));

        let steps: Vec<_> = report.steps.iter().map(|s| s.step_id.as_str().to_string()).collect();
        assert_eq!(steps, ["price", "post", "notify"]);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Succeeded && s.attempt == 1));

        harness.stop();
        assert_eq!(harness.jobs.depth(QUEUE).unwrap(), 0);
        assert_eq!(harness.events.count(LifecycleEventKind::ExecutionStarted), 1);
        assert_eq!(harness.events.count(LifecycleEventKind::StepSucceeded), 3);
        assert_eq!(harness.events.count(LifecycleEventKind::ExecutionCompleted), 1);
    }

    #[test]
    fn every_step_runs_once_under_concurrent_workers() {
        let definition = WorkflowDefinition::new("pair", 1, "a")
            .with_step(StepDefinition::new("a", "record").then("b"))
            .with_step(StepDefinition::new("b", "record"));

        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let recorder = seen.clone();
        let handlers = HandlerRegistry::builder()
            .register(
                "record",
                handler_fn(move |_, key| {
                    recorder.lock().unwrap().push(key.as_str().to_string());
                    StepOutcome::success()
                }),
            )
            .build();

        let harness = Harness::new(definition, handlers).run(4);
        let ids: Vec<_> = (0..40).map(|_| harness.start("pair", WorkflowContext::new())).collect();

        for id in &ids {
            assert_eq!(harness.settle(*id).execution.status(), ExecutionStatus::Completed);
        }

        let seen = seen.lock().unwrap();
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(seen.len(), 80);
        assert_eq!(unique.len(), 80);
    }

    #[test]
    fn permanent_failure_without_compensation_dead_letters() {
        let definition = WorkflowDefinition::new("charge", 1, "charge")
            .with_step(StepDefinition::new("charge", "card.charge").with_retry(fast_retry(3)));

        let calls = counter();
        let handler_calls = calls.clone();
        let handlers = HandlerRegistry::builder()
            .register(
                "card.charge",
                handler_fn(move |_, _| {
                    handler_calls.fetch_add(1, Ordering::SeqCst);
                    StepOutcome::permanent("card_declined", "insufficient funds")
                }),
            )
            .build();

        let mut harness = Harness::new(definition, handlers).run(2);
        let id = harness.start("charge", WorkflowContext::new());

        let report = harness.finish(id);
        assert_eq!(report.execution.status(), ExecutionStatus::DeadLettered);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].error_class, Some(ErrorClass::Permanent));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let dlq = harness.orchestrator.list_dlq(harness.tenant).unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].entry.execution_id, id);
        assert_eq!(dlq[0].entry.error_class, ErrorClass::Permanent);
        assert_eq!(dlq[0].entry.step_id.as_ref().map(|s| s.as_str()), Some("charge"));
        assert_eq!(dlq[0].reprocess_count, 0);
        assert_eq!(harness.events.count(LifecycleEventKind::ExecutionDeadLettered), 1);
    }

    #[test]
    fn transient_failures_retry_until_the_budget_is_spent() {
        let definition = WorkflowDefinition::new("sync", 1, "push")
            .with_step(StepDefinition::new("push", "ledger.push").with_retry(fast_retry(2)));

        let handlers = HandlerRegistry::builder()
            .register("ledger.push", handler_fn(|_, _| StepOutcome::transient("timeout", "ledger did not answer")))
            .build();

        let mut harness = Harness::new(definition, handlers).run(2);
        let id = harness.start("sync", WorkflowContext::new());

        let report = harness.finish(id);
        assert_eq!(report.execution.status(), ExecutionStatus::DeadLettered);

        let attempts: Vec<_> = report.steps.iter().map(|s| s.attempt).collect();
        assert_eq!(attempts, [1, 2]);
        assert!(report.steps[0].next_retry_at.is_some());
        assert!(report.steps[1].next_retry_at.is_none());
        assert_ne!(report.steps[0].idempotency_key, report.steps[1].idempotency_key);

        let dlq = harness.orchestrator.list_dlq(harness.tenant).unwrap();
        assert_eq!(dlq[0].entry.error_class, ErrorClass::Transient);
    }

    #[test]
    fn transient_failure_recovers_on_retry() {
        let definition = WorkflowDefinition::new("sync", 1, "push")
            .with_step(StepDefinition::new("push", "ledger.push").with_retry(fast_retry(3)));

        let handlers = HandlerRegistry::builder()
            .register(
                "ledger.push",
                handler_fn(|inv, _| {
                    if inv.attempt == 1 {
                        StepOutcome::transient("timeout", "ledger did not answer")
                    } else {
                        StepOutcome::success()
                    }
                }),
            )
            .build();

        let harness = Harness::new(definition, handlers).run(1);
        let id = harness.start("sync", WorkflowContext::new());

        let report = harness.settle(id);
        assert_eq!(report.execution.status(), ExecutionStatus::Completed);
        let statuses: Vec<_> = report.steps.iter().map(|s| s.status).collect();
        assert_eq!(statuses, [StepStatus::Failed, StepStatus::Succeeded]);
    }

    #[test]
    fn panicking_handler_is_retried_as_a_system_failure() {
        let definition = WorkflowDefinition::new("sync", 1, "push")
            .with_step(StepDefinition::new("push", "ledger.push").with_retry(fast_retry(2)));

        let handlers = HandlerRegistry::builder()
            .register("ledger.push", handler_fn(|_, _| panic!("ledger client bug")))
            .build();

        let harness = Harness::new(definition, handlers).run(1);
        let id = harness.start("sync", WorkflowContext::new());

        let report = harness.settle(id);
        assert_eq!(report.execution.status(), ExecutionStatus::DeadLettered);
        assert_eq!(report.steps.len(), 2);
        assert!(report.steps.iter().all(|s| s.error_class == Some(ErrorClass::System)));
    }

    #[test]
    fn failure_compensates_completed_steps_in_reverse_order() {
        let definition = WorkflowDefinition::new("onboard", 1, "account")
            .with_step(StepDefinition::new("account", "account.open").then("mandate").compensated_by("account.close"))
            .with_step(StepDefinition::new("mandate", "mandate.sign").then("audit").compensated_by("mandate.revoke"))
            .with_step(StepDefinition::new("audit", "audit.run").with_retry(RetryPolicy::no_retry()));

        let undone = Arc::new(Mutex::new(Vec::<String>::new()));
        let (close, revoke) = (undone.clone(), undone.clone());
        let handlers = HandlerRegistry::builder()
            .register("account.open", handler_fn(|_, _| StepOutcome::success()))
            .register("mandate.sign", handler_fn(|_, _| StepOutcome::success()))
            .register("audit.run", handler_fn(|_, _| StepOutcome::permanent("rejected", "audit failed")))
            .register(
                "account.close",
                handler_fn(move |inv, _| {
                    assert_eq!(inv.kind, StepKind::Compensation);
                    close.lock().unwrap().push(inv.step_id.as_str().to_string());
                    StepOutcome::success()
                }),
            )
            .register(
                "mandate.revoke",
                handler_fn(move |inv, _| {
                    revoke.lock().unwrap().push(inv.step_id.as_str().to_string());
                    StepOutcome::success()
                }),
            )
            .build();

        let mut harness = Harness::new(definition, handlers).run(3);
        let id = harness.start("onboard", WorkflowContext::new());

        let report = harness.finish(id);
        assert_eq!(report.execution.status(), ExecutionStatus::Compensated);
        assert_eq!(*undone.lock().unwrap(), ["mandate", "account"]);
        assert!(report.compensations.iter().all(|c| c.status == CompensationStatus::Succeeded));
        assert_eq!(report.compensations.len(), 2);
        assert!(harness.orchestrator.list_dlq(harness.tenant).unwrap().is_empty());
        assert_eq!(harness.events.count(LifecycleEventKind::ExecutionCompensated), 1);
        assert_eq!(harness.events.count(LifecycleEventKind::CompensationAttempted), 2);
    }

    #[test]
    fn only_completed_steps_are_compensated() {
        let definition = WorkflowDefinition::new("transfer", 1, "a")
            .with_step(StepDefinition::new("a", "debit").then("b").compensated_by("debit.undo"))
            .with_step(
                StepDefinition::new("b", "credit")
                    .with_retry(fast_retry(3))
                    .compensated_by("credit.undo"),
            );

        let (undo_a, undo_b) = (counter(), counter());
        let handlers = HandlerRegistry::builder()
            .register("debit", handler_fn(|_, _| StepOutcome::success()))
            .register("credit", handler_fn(|_, _| StepOutcome::permanent("account_closed", "target closed")))
            .register("debit.undo", counting(&undo_a))
            .register("credit.undo", counting(&undo_b))
            .build();

        let harness = Harness::new(definition, handlers).run(2);
        let id = harness.start("transfer", WorkflowContext::new());

        let report = harness.settle(id);
        assert_eq!(report.execution.status(), ExecutionStatus::Compensated);
        assert_eq!(undo_a.load(Ordering::SeqCst), 1);
        assert_eq!(undo_b.load(Ordering::SeqCst), 0);
        // b failed permanently: one attempt, no retries.
        let b_attempts = report.steps.iter().filter(|s| s.step_id.as_str() == "b").count();
        assert_eq!(b_attempts, 1);
    }

    #[test]
    fn failed_compensation_is_terminal_and_not_reprocessable() {
        let undo = CompensationSpec {
            step_type: "debit.undo".into(),
            retry: fast_retry(2),
        };
        let definition = WorkflowDefinition::new("transfer", 1, "a")
            .with_step(StepDefinition::new("a", "debit").then("b").compensated_with(undo))
            .with_step(StepDefinition::new("b", "credit").with_retry(RetryPolicy::no_retry()));

        let undo_calls = counter();
        let calls = undo_calls.clone();
        let handlers = HandlerRegistry::builder()
            .register("debit", handler_fn(|_, _| StepOutcome::success()))
            .register("credit", handler_fn(|_, _| StepOutcome::permanent("rejected", "no")))
            .register(
                "debit.undo",
                handler_fn(move |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    StepOutcome::transient("ledger_down", "cannot reverse")
                }),
            )
            .build();

        let mut harness = Harness::new(definition, handlers).run(2);
        let id = harness.start("transfer", WorkflowContext::new());

        let report = harness.finish(id);
        assert_eq!(report.execution.status(), ExecutionStatus::CompensationFailed);
        assert_eq!(undo_calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.compensations[0].status, CompensationStatus::Failed);
        assert_eq!(report.compensations[0].attempts, 2);

        let dlq = harness.orchestrator.list_dlq(harness.tenant).unwrap();
        assert_eq!(dlq.len(), 1);
        let entry = &dlq[0].entry;
        assert_eq!(entry.error_class, ErrorClass::Compensation);
        assert_eq!(entry.terminal_status, ExecutionStatus::CompensationFailed);
        assert_eq!(entry.step_id.as_ref().map(|s| s.as_str()), Some("a"));

        let err = harness.orchestrator.reprocess(harness.tenant, entry.id).unwrap_err();
        assert!(matches!(err, EngineError::NotReprocessable(_)));
        assert_eq!(harness.events.count(LifecycleEventKind::ExecutionCompensationFailed), 1);
    }

    #[test]
    fn fan_out_waits_for_every_branch_before_joining() {
        let definition = WorkflowDefinition::new("close_month", 1, "lock")
            .with_step(StepDefinition::new("lock", "period.lock").fan_out(["payroll", "vat", "bank"], Some("report")))
            .with_step(StepDefinition::new("payroll", "branch"))
            .with_step(StepDefinition::new("vat", "branch"))
            .with_step(StepDefinition::new("bank", "branch"))
            .with_step(StepDefinition::new("report", "period.report"));

        let handlers = HandlerRegistry::builder()
            .register("period.lock", handler_fn(|_, _| StepOutcome::success()))
            .register(
                "branch",
                handler_fn(|inv, _| {
                    thread::sleep(Duration::from_millis(20));
                    StepOutcome::success_with(WorkflowContext::new().with(inv.step_id.as_str(), json!("done")))
                }),
            )
            .register(
                "period.report",
                handler_fn(|inv, _| {
                    for branch in ["payroll", "vat", "bank"] {
                        assert_eq!(inv.context.get(branch), Some(&json!("done")), "{branch} missing at join");
                    }
                    StepOutcome::success()
                }),
            )
            .build();

        let harness = Harness::new(definition, handlers).run(4);
        let id = harness.start("close_month", WorkflowContext::new());

        let report = harness.settle(id);
        assert_eq!(report.execution.status(), ExecutionStatus::Completed);
        assert_eq!(report.steps.len(), 5);
        assert_eq!(report.steps.first().map(|s| s.step_id.as_str()), Some("lock"));
        assert_eq!(report.steps.last().map(|s| s.step_id.as_str()), Some("report"));
    }

    #[test]
    fn branch_finishing_after_a_sibling_failed_is_compensated() {
        let definition = WorkflowDefinition::new("provision", 1, "start")
            .with_step(
                StepDefinition::new("start", "noop")
                    .fan_out(["slow", "broken"], None)
                    .compensated_by("start.undo"),
            )
            .with_step(StepDefinition::new("slow", "slow").compensated_by("slow.undo"))
            .with_step(StepDefinition::new("broken", "broken").with_retry(RetryPolicy::no_retry()));

        let slow_started = Arc::new(AtomicBool::new(false));
        let (started, observed) = (slow_started.clone(), slow_started.clone());
        let (undo_start, undo_slow) = (counter(), counter());
        let handlers = HandlerRegistry::builder()
            .register("noop", handler_fn(|_, _| StepOutcome::success()))
            .register(
                "slow",
                handler_fn(move |_, _| {
                    started.store(true, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(150));
                    StepOutcome::success()
                }),
            )
            .register(
                "broken",
                handler_fn(move |_, _| {
                    let deadline = Instant::now() + Duration::from_secs(5);
                    while !observed.load(Ordering::SeqCst) && Instant::now() < deadline {
                        thread::sleep(Duration::from_millis(2));
                    }
                    StepOutcome::permanent("quota", "quota exceeded")
                }),
            )
            .register("start.undo", counting(&undo_start))
            .register("slow.undo", counting(&undo_slow))
            .build();

        let harness = Harness::new(definition, handlers).run(4);
        let id = harness.start("provision", WorkflowContext::new());

        let report = harness.settle(id);
        assert_eq!(report.execution.status(), ExecutionStatus::Compensated);
        assert_eq!(undo_start.load(Ordering::SeqCst), 1);
        assert_eq!(undo_slow.load(Ordering::SeqCst), 1);
        assert!(report.execution.fan_out().is_none_or(|f| f.pending.is_empty()));
    }

    #[test]
    fn cancel_lets_the_running_step_finish_and_stops_before_the_next() {
        let definition = WorkflowDefinition::new("export", 1, "a")
            .with_step(StepDefinition::new("a", "slow").then("b"))
            .with_step(StepDefinition::new("b", "never"));

        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let (a_started, a_release) = (started.clone(), release.clone());
        let b_calls = counter();
        let handlers = HandlerRegistry::builder()
            .register(
                "slow",
                handler_fn(move |_, _| {
                    a_started.wait();
                    a_release.wait();
                    StepOutcome::success()
                }),
            )
            .register("never", counting(&b_calls))
            .build();

        let mut harness = Harness::new(definition, handlers).run(2);
        let id = harness.start("export", WorkflowContext::new());

        started.wait();
        let requested = harness.orchestrator.cancel(harness.tenant, id);
        release.wait();
        assert!(requested.unwrap());

        let report = harness.finish(id);
        assert_eq!(report.execution.status(), ExecutionStatus::Cancelled);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].status, StepStatus::Succeeded);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.events.count(LifecycleEventKind::ExecutionCancelled), 1);

        // Terminal executions refuse further cancels.
        assert!(!harness.orchestrator.cancel(harness.tenant, id).unwrap());
    }

    #[test]
    fn cancel_before_the_first_step_never_runs_it() {
        let definition = WorkflowDefinition::new("export", 1, "a").with_step(StepDefinition::new("a", "step"));
        let calls = counter();
        let handlers = HandlerRegistry::builder().register("step", counting(&calls)).build();

        let harness = Harness::new(definition, handlers);
        let id = harness.start("export", WorkflowContext::new());
        assert!(harness.orchestrator.cancel(harness.tenant, id).unwrap());

        let harness = harness.run(1);
        let report = harness.settle(id);
        assert_eq!(report.execution.status(), ExecutionStatus::Cancelled);
        assert!(report.steps.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn abandoned_job_is_reclaimed_after_its_lease_expires() {
        let definition = WorkflowDefinition::new("post", 1, "a").with_step(StepDefinition::new("a", "step"));
        let calls = counter();
        let handlers = HandlerRegistry::builder().register("step", counting(&calls)).build();

        let harness = Harness::new(definition, handlers);
        let id = harness.start("post", WorkflowContext::new());

        // A worker claims the entry job and dies without reporting back.
        let crashed = WorkerId::new("crashed-0");
        let claimed = harness.jobs.claim(&crashed, QUEUE, 1, Duration::from_millis(40)).unwrap();
        assert_eq!(claimed.len(), 1);

        let harness = harness.run(1);
        let report = harness.settle(id);
        assert_eq!(report.execution.status(), ExecutionStatus::Completed);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn redelivered_attempt_reuses_its_key_and_side_effect_happens_once() {
        let definition = WorkflowDefinition::new("post", 1, "a").with_step(StepDefinition::new("a", "ledger.post"));

        let side_effects = counter();
        let effects = side_effects.clone();
        let keys = InMemoryProcessedKeyStore::arc();
        let posting = handler_fn(move |_, _| {
            thread::sleep(Duration::from_millis(150));
            effects.fetch_add(1, Ordering::SeqCst);
            StepOutcome::success()
        });
        let handlers = HandlerRegistry::builder()
            .register("ledger.post", DedupingHandler::new(posting, keys.clone()))
            .build();

        // Short lease and no heartbeat: the second worker steals the job
        // while the first one is still inside the handler.
        let config = pool_config(2)
            .with_lease(Duration::from_millis(40))
            .with_heartbeat_interval(Duration::from_secs(3600));
        let mut harness = Harness::new(definition, handlers).run_with(config);
        let id = harness.start("post", WorkflowContext::new());

        let report = harness.settle(id);
        assert_eq!(report.execution.status(), ExecutionStatus::Completed);
        assert_eq!(report.steps.len(), 1);

        harness.stop();
        assert_eq!(side_effects.load(Ordering::SeqCst), 1);
        assert_eq!(keys.completed(), 1);
    }

    #[test]
    fn stale_jobs_for_finished_steps_are_dropped() {
        let definition = WorkflowDefinition::new("post", 1, "a").with_step(StepDefinition::new("a", "step"));
        let calls = counter();
        let handlers = HandlerRegistry::builder().register("step", counting(&calls)).build();

        let mut harness = Harness::new(definition, handlers).run(1);
        let id = harness.start("post", WorkflowContext::new());
        harness.settle(id);

        // A duplicate of the entry job shows up after completion.
        let execution = harness.report(id).execution;
        let stale = Job::new(
            Some(harness.tenant),
            QUEUE,
            StepJob::forward(id, "a".into(), 1),
            execution.correlation_id().clone(),
        )
        .unwrap();
        harness.jobs.enqueue(stale).unwrap();

        wait_until("stale job to be drained", || (harness.jobs.depth(QUEUE).unwrap() == 0).then_some(()));
        harness.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.report(id).steps.len(), 1);
    }

    #[test]
    fn reprocess_resumes_from_the_failed_step() {
        let definition = WorkflowDefinition::new("sync", 1, "fetch")
            .with_step(StepDefinition::new("fetch", "fetch").then("push"))
            .with_step(StepDefinition::new("push", "push").with_retry(RetryPolicy::no_retry()));

        let fetches = counter();
        let broken = Arc::new(AtomicBool::new(true));
        let push_broken = broken.clone();
        let handlers = HandlerRegistry::builder()
            .register("fetch", counting(&fetches))
            .register(
                "push",
                handler_fn(move |_, _| {
                    if push_broken.load(Ordering::SeqCst) {
                        StepOutcome::transient("unavailable", "remote down")
                    } else {
                        StepOutcome::success()
                    }
                }),
            )
            .build();

        let harness = Harness::new(definition, handlers).run(2);
        let original = harness.start("sync", WorkflowContext::new());
        assert_eq!(harness.settle(original).execution.status(), ExecutionStatus::DeadLettered);

        broken.store(false, Ordering::SeqCst);
        let entry = wait_until("dead letter entry", || {
            harness.orchestrator.list_dlq(harness.tenant).unwrap().pop()
        })
        .entry;
        let resumed = harness.orchestrator.reprocess(harness.tenant, entry.id).unwrap();
        assert_eq!(resumed.parent_execution_id(), Some(original));

        let report = harness.settle(resumed.id());
        assert_eq!(report.execution.status(), ExecutionStatus::Completed);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].step_id.as_str(), "push");
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        // The original stays frozen; the entry now counts the reprocess.
        assert_eq!(harness.report(original).execution.status(), ExecutionStatus::DeadLettered);
        let listing = harness.orchestrator.list_dlq(harness.tenant).unwrap();
        assert_eq!(listing[0].reprocess_count, 1);
        assert_eq!(harness.events.count(LifecycleEventKind::ExecutionReprocessed), 1);
    }

    #[test]
    fn dlq_depth_alert_fires_when_threshold_is_reached() {
        let definition = WorkflowDefinition::new("charge", 1, "charge")
            .with_step(StepDefinition::new("charge", "card.charge"));
        let handlers = HandlerRegistry::builder()
            .register("card.charge", handler_fn(|_, _| StepOutcome::permanent("declined", "no")))
            .build();

        let harness = Harness::configured(definition, handlers, |b| b.dlq_alert_threshold(2)).run(1);
        let dlq_len = || harness.orchestrator.list_dlq(harness.tenant).unwrap().len();

        harness.start("charge", WorkflowContext::new());
        wait_until("first dead letter", || (dlq_len() == 1).then_some(()));
        assert_eq!(harness.events.count(LifecycleEventKind::DlqDepthExceeded), 0);

        harness.start("charge", WorkflowContext::new());
        wait_until("depth alert", || {
            (harness.events.count(LifecycleEventKind::DlqDepthExceeded) == 1).then_some(())
        });
        assert_eq!(dlq_len(), 2);
    }

    #[test]
    fn simultaneous_dead_letters_raise_the_depth_alert_once() {
        let definition = WorkflowDefinition::new("charge", 1, "charge")
            .with_step(StepDefinition::new("charge", "card.charge"));
        let handlers = HandlerRegistry::builder()
            .register("card.charge", handler_fn(|_, _| StepOutcome::permanent("declined", "no")))
            .build();

        // Both DLQ writes are released together.
        let dead_letters = Arc::new(GatedDeadLetters {
            gate: Some(Barrier::new(2)),
            ..GatedDeadLetters::default()
        });
        let mut harness = Harness::wired(definition, handlers, |jobs| jobs, dead_letters, |b| {
            b.dlq_alert_threshold(1)
        })
        .run(2);

        let first = harness.start("charge", WorkflowContext::new());
        let second = harness.start("charge", WorkflowContext::new());
        harness.settle(first);
        harness.finish(second);

        assert_eq!(harness.orchestrator.list_dlq(harness.tenant).unwrap().len(), 2);
        assert_eq!(harness.events.count(LifecycleEventKind::DlqDepthExceeded), 1);
    }

    #[test]
    fn lost_follow_up_is_republished_when_the_job_comes_back() {
        let definition = WorkflowDefinition::new("post", 1, "a")
            .with_step(StepDefinition::new("a", "first").then("b"))
            .with_step(StepDefinition::new("b", "second"));
        let (firsts, seconds) = (counter(), counter());
        let handlers = HandlerRegistry::builder()
            .register("first", counting(&firsts))
            .register("second", counting(&seconds))
            .build();

        // Enqueue #0 is the entry job; #1 (the job for `b`) is lost after
        // the execution already moved to `b`.
        let publish = |jobs: Arc<dyn JobStore>| -> Arc<dyn JobStore> {
            Arc::new(FailingEnqueue {
                inner: jobs,
                calls: AtomicU32::new(0),
                fail_on: 1,
            })
        };
        let mut harness = Harness::wired(definition, handlers, publish, InMemoryDeadLetterStore::arc(), |b| b)
            .run_with(redelivering_pool(1));
        let id = harness.start("post", WorkflowContext::new());

        let report = harness.finish(id);
        assert_eq!(report.execution.status(), ExecutionStatus::Completed);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(firsts.load(Ordering::SeqCst), 1);
        assert_eq!(seconds.load(Ordering::SeqCst), 1);
        assert_eq!(harness.jobs.depth(QUEUE).unwrap(), 0);
    }

    #[test]
    fn lost_retry_keeps_its_attempt_number() {
        let definition = WorkflowDefinition::new("post", 1, "a")
            .with_step(StepDefinition::new("a", "flaky").with_retry(fast_retry(3)));
        let attempts = Arc::new(Mutex::new(Vec::<u32>::new()));
        let seen = attempts.clone();
        let handlers = HandlerRegistry::builder()
            .register(
                "flaky",
                handler_fn(move |inv, _| {
                    seen.lock().unwrap().push(inv.attempt);
                    if inv.attempt == 1 {
                        StepOutcome::transient("busy", "try later")
                    } else {
                        StepOutcome::success()
                    }
                }),
            )
            .build();

        let publish = |jobs: Arc<dyn JobStore>| -> Arc<dyn JobStore> {
            Arc::new(FailingEnqueue {
                inner: jobs,
                calls: AtomicU32::new(0),
                fail_on: 1,
            })
        };
        let mut harness = Harness::wired(definition, handlers, publish, InMemoryDeadLetterStore::arc(), |b| b)
            .run_with(redelivering_pool(1));
        let id = harness.start("post", WorkflowContext::new());

        let report = harness.finish(id);
        assert_eq!(report.execution.status(), ExecutionStatus::Completed);
        let recorded: Vec<u32> = report.steps.iter().map(|s| s.attempt).collect();
        assert_eq!(recorded, [1, 2]);
        // The redelivered first attempt may run its handler again, but it is
        // never recorded twice and attempt 2 runs once.
        assert_eq!(attempts.lock().unwrap().iter().filter(|a| **a == 2).count(), 1);
    }

    #[test]
    fn lost_dead_letter_entry_is_written_when_the_job_comes_back() {
        let definition = WorkflowDefinition::new("charge", 1, "charge")
            .with_step(StepDefinition::new("charge", "card.charge"));
        let handlers = HandlerRegistry::builder()
            .register("card.charge", handler_fn(|_, _| StepOutcome::permanent("declined", "no")))
            .build();

        let dead_letters = Arc::new(GatedDeadLetters {
            fail_first: AtomicBool::new(true),
            ..GatedDeadLetters::default()
        });
        let mut harness = Harness::wired(definition, handlers, |jobs| jobs, dead_letters, |b| {
            b.dlq_alert_threshold(1)
        })
        .run_with(redelivering_pool(1));
        let id = harness.start("charge", WorkflowContext::new());
        harness.settle(id);

        let entry = wait_until("dead letter entry", || {
            harness.orchestrator.list_dlq(harness.tenant).unwrap().pop()
        })
        .entry;
        harness.stop();
        assert_eq!(entry.execution_id, id);
        assert_eq!(entry.step_id.as_ref().map(|s| s.as_str()), Some("charge"));
        assert_eq!(entry.error_class, ErrorClass::Permanent);
        assert_eq!(harness.orchestrator.list_dlq(harness.tenant).unwrap().len(), 1);
        assert_eq!(harness.events.count(LifecycleEventKind::DlqDepthExceeded), 1);
    }

    #[test]
    fn lifecycle_events_carry_firm_correlation_step_attempt_and_latency() {
        let definition = WorkflowDefinition::new("onboard", 1, "account")
            .with_step(StepDefinition::new("account", "account.open").then("audit").compensated_by("account.close"))
            .with_step(StepDefinition::new("audit", "audit.run").with_retry(RetryPolicy::no_retry()));
        fn verdict(inv: &StepInvocation<'_>, field: &str) -> Option<String> {
            inv.context.get(field).and_then(|v| v.as_str()).map(str::to_string)
        }
        let handlers = HandlerRegistry::builder()
            .register(
                "account.open",
                handler_fn(|inv, _| match verdict(inv, "open").as_deref() {
                    Some("refuse") => StepOutcome::permanent("kyc_failed", "identity not verified"),
                    _ => StepOutcome::success(),
                }),
            )
            .register(
                "audit.run",
                handler_fn(|inv, _| match verdict(inv, "audit").as_deref() {
                    Some("pass") => StepOutcome::success(),
                    _ => StepOutcome::permanent("rejected", "audit failed"),
                }),
            )
            .register("account.close", handler_fn(|_, _| StepOutcome::success()))
            .build();

        let mut harness = Harness::new(definition, handlers).run(2);
        let completed = harness.start("onboard", WorkflowContext::new().with("audit", json!("pass")));
        let compensated = harness.start("onboard", WorkflowContext::new());
        let dead_lettered = harness.start("onboard", WorkflowContext::new().with("open", json!("refuse")));
        harness.settle(completed);
        harness.settle(compensated);
        harness.finish(dead_lettered);
        assert_eq!(harness.report(completed).execution.status(), ExecutionStatus::Completed);
        assert_eq!(harness.report(compensated).execution.status(), ExecutionStatus::Compensated);
        assert_eq!(harness.report(dead_lettered).execution.status(), ExecutionStatus::DeadLettered);

        let required = [
            LifecycleEventKind::ExecutionStarted,
            LifecycleEventKind::StepAttempted,
            LifecycleEventKind::StepFailed,
            LifecycleEventKind::StepSucceeded,
            LifecycleEventKind::ExecutionCompleted,
            LifecycleEventKind::ExecutionDeadLettered,
            LifecycleEventKind::ExecutionCompensated,
        ];
        let events = harness.events.events();
        for kind in required {
            let of_kind: Vec<_> = events.iter().filter(|e| e.kind() == kind).collect();
            assert!(!of_kind.is_empty(), "no {kind} event");
            for event in of_kind {
                let execution = harness.report(event.execution_id().expect("execution id")).execution;
                assert_eq!(event.tenant_id(), harness.tenant, "{kind}");
                assert_eq!(event.correlation_id(), execution.correlation_id(), "{kind}");
                assert!(event.step_id().is_some(), "{kind} has no step");
                assert!(event.attempt().is_some_and(|a| a >= 1), "{kind} has no attempt");
                assert!(event.latency_ms().is_some(), "{kind} has no latency");
            }
        }

        let finished = |kind: LifecycleEventKind, id: ExecutionId| {
            events
                .iter()
                .find(|e| e.kind() == kind && e.execution_id() == Some(id))
                .and_then(|e| e.step_id().map(str::to_string))
        };
        assert_eq!(finished(LifecycleEventKind::ExecutionStarted, completed).as_deref(), Some("account"));
        assert_eq!(finished(LifecycleEventKind::ExecutionCompleted, completed).as_deref(), Some("audit"));
        assert_eq!(finished(LifecycleEventKind::ExecutionCompensated, compensated).as_deref(), Some("account"));
        assert_eq!(finished(LifecycleEventKind::ExecutionDeadLettered, dead_lettered).as_deref(), Some("account"));
    }

    #[test]
    fn admin_operations_are_firm_scoped() {
        let definition = WorkflowDefinition::new("charge", 1, "charge")
            .with_step(StepDefinition::new("charge", "card.charge"));
        let handlers = HandlerRegistry::builder()
            .register("card.charge", handler_fn(|_, _| StepOutcome::permanent("declined", "no")))
            .build();

        let mut harness = Harness::new(definition, handlers).run(1);
        let id = harness.start("charge", WorkflowContext::new());
        harness.finish(id);

        let other = TenantId::new();
        let orchestrator = &harness.orchestrator;
        assert!(orchestrator.get_status(other, id).unwrap_err().is_not_found());
        assert!(orchestrator.cancel(other, id).unwrap_err().is_not_found());
        assert!(orchestrator.list_dlq(other).unwrap().is_empty());

        let entry = orchestrator.list_dlq(harness.tenant).unwrap().remove(0).entry;
        assert!(orchestrator.reprocess(other, entry.id).unwrap_err().is_not_found());
        assert!(orchestrator.reprocess_execution(other, id).unwrap_err().is_not_found());

        assert!(harness.events.events_for(other).is_empty());
        assert!(!harness.events.events_for(harness.tenant).is_empty());
    }

    #[test]
    fn start_rejects_missing_firm_and_unregistered_handlers() {
        let definition = WorkflowDefinition::new("charge", 1, "charge")
            .with_step(StepDefinition::new("charge", "card.charge"));
        let harness = Harness::new(definition, HandlerRegistry::default());

        let missing_firm = harness.orchestrator.start_execution(StartExecution {
            tenant_id: None,
            definition_id: DefinitionId::new("charge"),
            version: 1,
            context: WorkflowContext::new(),
            correlation_id: None,
        });
        assert!(matches!(missing_firm, Err(EngineError::Domain(_))));

        let unregistered = harness.orchestrator.start_execution(StartExecution {
            tenant_id: Some(harness.tenant),
            definition_id: DefinitionId::new("charge"),
            version: 1,
            context: WorkflowContext::new(),
            correlation_id: None,
        });
        assert!(matches!(unregistered, Err(EngineError::Definition(_))));

        let unknown = harness.orchestrator.start_execution(StartExecution {
            tenant_id: Some(harness.tenant),
            definition_id: DefinitionId::new("charge"),
            version: 7,
            context: WorkflowContext::new(),
            correlation_id: None,
        });
        assert!(unknown.unwrap_err().is_not_found());
        assert_eq!(harness.jobs.depth(QUEUE).unwrap(), 0);
        assert!(harness.executions.steps(harness.tenant, ExecutionId::new()).is_err());
    }
}
