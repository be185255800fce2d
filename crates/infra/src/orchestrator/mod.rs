//! Orchestrator: drives executions through their state machine.
//!
//! Every job is processed in up to three phases:
//!
//! 1. gate: reload the execution, drop stale jobs, honour cancel requests
//!    and start pending executions;
//! 2. run: invoke the handler through the step executor (no locks, no
//!    store access);
//! 3. resolve: record the attempt and apply the transition it causes.
//!
//! Phases 1 and 3 are optimistic read-modify-write cycles against the
//! execution store (`commit`). Follow-up jobs, DLQ entries and lifecycle
//! events are only published after the write succeeded. Job and DLQ ids are
//! derived from what they stand for, so publishing can be repeated; a
//! redelivered job that finds nothing to do re-publishes what the stored
//! execution is waiting on (see `recovery`).

mod admin;
mod compensation;
mod recovery;
mod step_executor;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use forgeflow_core::{ExecutionId, ExpectedVersion, TenantId};
use forgeflow_events::{LifecycleEvent, LifecycleEventKind, LifecycleListener, Listeners};
use forgeflow_workflow::{
    CompensationRecord, DefinitionError, DefinitionSource, ErrorClass, ExecutionStatus,
    HandlerRegistry, StepDefinition, StepExecution, StepId, StepKind, Transition,
    WorkflowDefinition, WorkflowExecution, compensation_plan,
};

pub use admin::{ExecutionReport, StartExecution};
pub use step_executor::{StepExecutor, StepRequest};

use crate::config::EngineConfig;
use crate::dlq::{DeadLetterEntry, DeadLetterError, DeadLetterStore, DepthChange};
use crate::error::EngineError;
use crate::executions::{ExecutionStore, ExecutionStoreError};
use crate::jobs::{ClaimedJob, Disposition, Job, JobProcessor, JobStore, JobStoreError, StepJob};
use crate::retry::RetryScheduler;

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Queue follow-up jobs are enqueued into.
    pub queue: String,
    /// Deliveries of one attempt before it fails without running.
    pub max_deliveries: u32,
    /// Per-firm DLQ depth that raises `dlq.depth_exceeded` (0 disables).
    pub dlq_alert_threshold: usize,
    /// Reload-and-reapply rounds on version conflicts.
    pub max_update_retries: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            queue: "workflow-steps".to_string(),
            max_deliveries: 5,
            dlq_alert_threshold: 100,
            max_update_retries: 16,
        }
    }
}

impl From<&EngineConfig> for OrchestratorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            max_deliveries: config.max_deliveries,
            dlq_alert_threshold: config.dlq_alert_threshold,
            ..Self::default()
        }
    }
}

/// Side effects of one execution write, published after it commits.
struct Plan {
    record: Option<StepExecution>,
    jobs: Vec<Job>,
    compensations: Vec<CompensationRecord>,
    dead_letter: Option<DeadLetterEntry>,
    events: Vec<LifecycleEvent>,
    disposition: Disposition,
    /// The execution was mutated and must be written.
    dirty: bool,
    /// Gate only: go on and run the handler.
    proceed: bool,
}

impl Plan {
    fn new() -> Self {
        Self {
            record: None,
            jobs: Vec::new(),
            compensations: Vec::new(),
            dead_letter: None,
            events: Vec::new(),
            disposition: Disposition::Skipped,
            dirty: false,
            proceed: false,
        }
    }

    fn push(&mut self, event: LifecycleEvent) {
        self.events.push(event);
    }

    fn needs_write(&self) -> bool {
        self.dirty || self.record.is_some()
    }
}

/// Execution-scoped event; latency is the execution's age.
fn event(execution: &WorkflowExecution, kind: LifecycleEventKind) -> LifecycleEvent {
    LifecycleEvent::for_execution(
        kind,
        execution.tenant_id(),
        execution.correlation_id().clone(),
        execution.id(),
    )
    .with_latency_ms(elapsed_ms(execution.created_at()))
}

/// Execution-level event caused by one attempt of `step`.
fn resolved_event(
    execution: &WorkflowExecution,
    kind: LifecycleEventKind,
    step: &StepId,
    attempt: u32,
) -> LifecycleEvent {
    event(execution, kind).with_step(step.as_str(), attempt)
}

fn elapsed_ms(since: DateTime<Utc>) -> u64 {
    (Utc::now() - since).num_milliseconds().max(0) as u64
}

/// Event carrying step, attempt, latency and error of a resolved attempt.
fn step_event(execution: &WorkflowExecution, kind: LifecycleEventKind, record: &StepExecution) -> LifecycleEvent {
    let event = event(execution, kind)
        .with_step(record.step_id.as_str(), record.attempt)
        .with_latency_ms(record.latency_ms());
    match &record.error {
        Some(error) => event.with_detail(error.to_string()),
        None => event,
    }
}

/// The workflow engine core.
pub struct Orchestrator {
    jobs: Arc<dyn JobStore>,
    executions: Arc<dyn ExecutionStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    definitions: Arc<dyn DefinitionSource>,
    executor: StepExecutor,
    retry: RetryScheduler,
    listeners: Listeners,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("handlers", self.executor.handlers())
            .field("retry", &self.retry)
            .field("listeners", &self.listeners)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Wires stores, handlers and listeners into an [`Orchestrator`].
pub struct OrchestratorBuilder {
    jobs: Arc<dyn JobStore>,
    executions: Arc<dyn ExecutionStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    definitions: Arc<dyn DefinitionSource>,
    handlers: HandlerRegistry,
    retry: RetryScheduler,
    listeners: Listeners,
    settings: OrchestratorSettings,
}

impl OrchestratorBuilder {
    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Queue, delivery budget, DLQ threshold and jitter from `config`.
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.settings = OrchestratorSettings {
            max_update_retries: self.settings.max_update_retries,
            ..OrchestratorSettings::from(config)
        };
        self.retry = RetryScheduler::new(config.jitter);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.settings.queue = queue.into();
        self
    }

    pub fn max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.settings.max_deliveries = max_deliveries;
        self
    }

    pub fn dlq_alert_threshold(mut self, threshold: usize) -> Self {
        self.settings.dlq_alert_threshold = threshold;
        self
    }

    pub fn retry_scheduler(mut self, retry: RetryScheduler) -> Self {
        self.retry = retry;
        self
    }

    pub fn listener<L>(mut self, listener: L) -> Self
    where
        L: LifecycleListener + 'static,
    {
        self.listeners = self.listeners.with(listener);
        self
    }

    pub fn listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            jobs: self.jobs,
            executions: self.executions,
            dead_letters: self.dead_letters,
            definitions: self.definitions,
            executor: StepExecutor::new(self.handlers),
            retry: self.retry,
            listeners: self.listeners,
            settings: self.settings,
        }
    }
}

impl Orchestrator {
    pub fn builder(
        jobs: Arc<dyn JobStore>,
        executions: Arc<dyn ExecutionStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        definitions: Arc<dyn DefinitionSource>,
        handlers: HandlerRegistry,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            jobs,
            executions,
            dead_letters,
            definitions,
            handlers,
            retry: RetryScheduler::default(),
            listeners: Listeners::new(),
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    fn load(&self, tenant_id: TenantId, id: ExecutionId) -> Result<WorkflowExecution, EngineError> {
        self.executions.get(tenant_id, id).map_err(|e| match e {
            ExecutionStoreError::NotFound(id) => EngineError::ExecutionNotFound(id),
            other => other.into(),
        })
    }

    fn definition_of(&self, execution: &WorkflowExecution) -> Result<WorkflowDefinition, DefinitionError> {
        self.definitions
            .get_definition(execution.definition_id(), execution.definition_version())
    }

    /// New job for `execution` on the orchestrator queue, keyed by its attempt.
    fn job_for(&self, execution: &WorkflowExecution, payload: StepJob, priority: i32) -> Result<Job, EngineError> {
        Ok(Job::new(
            Some(execution.tenant_id()),
            self.settings.queue.clone(),
            payload,
            execution.correlation_id().clone(),
        )?
        .with_priority(priority)
        .keyed())
    }

    /// Enqueue `job`; an attempt that is already queued is left as is.
    fn enqueue(&self, job: Job) -> Result<(), EngineError> {
        debug!(
            job_id = %job.id,
            step_id = %job.payload.step_id,
            kind = ?job.payload.kind,
            attempt = job.payload.attempt,
            available_at = %job.available_at,
            "enqueueing step job"
        );
        match self.jobs.enqueue(job) {
            Ok(_) => Ok(()),
            Err(JobStoreError::AlreadyExists(id)) => {
                debug!(job_id = %id, "step job already queued");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a DLQ entry and raise the depth alert if this write crossed it.
    fn write_dead_letter(&self, entry: DeadLetterEntry) -> Result<(), EngineError> {
        let tenant_id = entry.tenant_id;
        let correlation_id = entry.correlation_id.clone();
        match self.dead_letters.write(entry) {
            Ok(change) => {
                self.check_dlq_depth(tenant_id, &correlation_id, change);
                Ok(())
            }
            Err(DeadLetterError::AlreadyExists(id)) => {
                debug!(dead_letter_id = %id, "dead letter entry already written");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Optimistic read-modify-write of one execution.
    ///
    /// `apply` mutates a fresh copy and fills the plan; on a version conflict
    /// the execution is reloaded and `apply` runs again from scratch.
    fn commit<F>(&self, tenant_id: TenantId, id: ExecutionId, mut apply: F) -> Result<(WorkflowExecution, Plan), EngineError>
    where
        F: FnMut(&mut WorkflowExecution, &mut Plan) -> Result<(), EngineError>,
    {
        for round in 0..self.settings.max_update_retries.max(1) {
            let current = self.load(tenant_id, id)?;
            let mut next = current.clone();
            let mut plan = Plan::new();
            apply(&mut next, &mut plan)?;

            if !plan.needs_write() {
                return Ok((current, plan));
            }

            match self.executions.commit_step(
                next,
                ExpectedVersion::Exact(current.version()),
                plan.record.clone(),
            ) {
                Ok(stored) => return Ok((stored, plan)),
                Err(ExecutionStoreError::Conflict(reason)) => {
                    debug!(execution_id = %id, round, %reason, "execution changed concurrently; re-applying");
                }
                Err(ExecutionStoreError::DuplicateAttempt { step_id, attempt, .. }) => {
                    warn!(execution_id = %id, %step_id, attempt, "attempt already recorded by another delivery");
                    return Ok((current, Plan::new()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::ContentionExhausted(id))
    }

    /// Enqueue follow-ups, write compensation/DLQ records, emit events.
    fn publish(&self, plan: Plan) -> Result<Disposition, EngineError> {
        for record in plan.compensations {
            self.executions.upsert_compensation(record)?;
        }
        for job in plan.jobs {
            self.enqueue(job)?;
        }
        if let Some(entry) = plan.dead_letter {
            self.write_dead_letter(entry)?;
        }
        for event in plan.events {
            self.listeners.emit(event);
        }
        Ok(plan.disposition)
    }

    /// Alerts once per crossing: only the write that took the firm's depth
    /// from below the threshold to it fires.
    fn check_dlq_depth(&self, tenant_id: TenantId, correlation_id: &forgeflow_core::CorrelationId, change: DepthChange) {
        let threshold = self.settings.dlq_alert_threshold;
        if !change.crossed(threshold) {
            return;
        }
        let depth = change.after;
        error!(firm_id = %tenant_id, depth, threshold, "dead letter queue depth reached alert threshold");
        self.listeners.emit(
            LifecycleEvent::new(LifecycleEventKind::DlqDepthExceeded, tenant_id, correlation_id.clone())
                .with_detail(format!("depth {depth} reached threshold {threshold}")),
        );
    }

    /// Attempt events measure how long the job waited to be claimed.
    fn emit_now(&self, execution: &WorkflowExecution, kind: LifecycleEventKind, job: &Job) {
        self.listeners.emit(
            resolved_event(execution, kind, &job.payload.step_id, job.payload.attempt)
                .with_latency_ms(elapsed_ms(job.available_at.max(job.enqueued_at))),
        );
    }

    /// The definition can no longer be followed: terminal `Failed`.
    fn fail_execution(&self, claimed: &ClaimedJob, reason: String) -> Result<Disposition, EngineError> {
        let job = &claimed.job;
        let (_, plan) = self.commit(job.tenant_id, job.payload.execution_id, |exec, plan| {
            if exec.status().can_transition_to(ExecutionStatus::Failed) {
                exec.fail(reason.clone())?;
                plan.dirty = true;
                plan.disposition = Disposition::Failed;
                plan.push(
                    resolved_event(exec, LifecycleEventKind::ExecutionFailed, &job.payload.step_id, job.payload.attempt)
                        .with_detail(reason.clone()),
                );
            }
            Ok(())
        })?;
        if plan.dirty {
            error!(execution_id = %job.payload.execution_id, %reason, "execution failed");
        }
        self.publish(plan)
    }

    fn cancel_now(
        &self,
        exec: &mut WorkflowExecution,
        plan: &mut Plan,
        step: &StepId,
        attempt: u32,
    ) -> Result<(), EngineError> {
        exec.cancel()?;
        plan.dirty = true;
        plan.push(resolved_event(exec, LifecycleEventKind::ExecutionCancelled, step, attempt));
        info!(execution_id = %exec.id(), firm_id = %exec.tenant_id(), "execution cancelled");
        Ok(())
    }

    /// `Compensating -> Compensated` once the queue and the barrier are drained.
    fn maybe_finish_compensation(
        &self,
        exec: &mut WorkflowExecution,
        plan: &mut Plan,
        step: &StepId,
        attempt: u32,
    ) -> Result<(), EngineError> {
        if exec.compensation_queue().is_empty() && !exec.awaiting_branches() {
            exec.finish_compensation()?;
            plan.dirty = true;
            plan.push(resolved_event(exec, LifecycleEventKind::ExecutionCompensated, step, attempt));
            info!(execution_id = %exec.id(), firm_id = %exec.tenant_id(), "execution compensated");
        }
        Ok(())
    }

    fn process_forward(&self, claimed: &ClaimedJob) -> Result<Disposition, EngineError> {
        let job = &claimed.job;
        let payload = &job.payload;

        let current = self.load(job.tenant_id, payload.execution_id)?;
        let definition = match self.definition_of(&current) {
            Ok(d) => d,
            Err(DefinitionError::NotFound { id, version }) => {
                return self.fail_execution(claimed, format!("definition {id} v{version} not found"));
            }
            Err(e) => return Err(e.into()),
        };
        let Some(step_def) = definition.step(&payload.step_id).cloned() else {
            return self.fail_execution(
                claimed,
                format!("step {} is not part of {} v{}", payload.step_id, definition.id, definition.version),
            );
        };

        let (execution, gate) = self.commit(job.tenant_id, payload.execution_id, |exec, plan| {
            self.gate_forward(exec, payload, plan)
        })?;
        let proceed = gate.proceed;
        let disposition = self.publish(gate)?;
        if !proceed {
            debug!(disposition = ?disposition, "job not run");
            return Ok(disposition);
        }

        self.emit_now(&execution, LifecycleEventKind::StepAttempted, job);

        let request = StepRequest {
            execution: &execution,
            step_id: &payload.step_id,
            kind: StepKind::Forward,
            attempt: payload.attempt,
            step_type: &step_def.step_type,
            classifier: &step_def.retry.classifier,
        };
        let record = if job.attempt_count > self.settings.max_deliveries {
            warn!(deliveries = job.attempt_count, "delivery budget exhausted; failing attempt");
            self.executor.undeliverable(request, job.attempt_count)
        } else {
            self.executor.run(request)
        };

        let (_, plan) = self.commit(job.tenant_id, payload.execution_id, |exec, plan| {
            self.resolve_forward(exec, plan, &definition, &step_def, job, record.clone())
        })?;
        self.publish(plan)
    }

    fn gate_forward(&self, exec: &mut WorkflowExecution, job: &StepJob, plan: &mut Plan) -> Result<(), EngineError> {
        if exec.is_terminal() {
            debug!(status = exec.status().as_str(), "execution is terminal; dropping job");
            return Ok(());
        }

        let step = &job.step_id;
        let branch = exec.is_pending_branch(step);

        if exec.status() == ExecutionStatus::Compensating {
            if branch {
                // The barrier was abandoned; the branch never starts.
                exec.release_branch(step);
                plan.dirty = true;
                self.maybe_finish_compensation(exec, plan, step, job.attempt)?;
            }
            return Ok(());
        }

        let current = exec.fan_out().is_none() && exec.current_step_id() == Some(step);
        if !branch && !current {
            debug!("step is not due; dropping stale job");
            return Ok(());
        }

        if exec.cancel_requested() {
            if branch {
                exec.release_branch(step);
                plan.dirty = true;
                if exec.awaiting_branches() {
                    return Ok(());
                }
                exec.close_fan_out();
            }
            return self.cancel_now(exec, plan, step, job.attempt);
        }

        if exec.start()? {
            plan.dirty = true;
            plan.push(resolved_event(exec, LifecycleEventKind::ExecutionStarted, step, job.attempt));
            info!(execution_id = %exec.id(), firm_id = %exec.tenant_id(), "execution started");
        }
        plan.proceed = true;
        Ok(())
    }

    fn resolve_forward(
        &self,
        exec: &mut WorkflowExecution,
        plan: &mut Plan,
        definition: &WorkflowDefinition,
        step_def: &StepDefinition,
        job: &Job,
        mut record: StepExecution,
    ) -> Result<(), EngineError> {
        let step = &step_def.id;
        let attempt = record.attempt;
        let branch = exec.is_pending_branch(step);

        match exec.status() {
            ExecutionStatus::Running => {}
            ExecutionStatus::Compensating if branch => {
                return self.resolve_late_branch(exec, plan, step_def, record);
            }
            ExecutionStatus::DeadLettered if branch => {
                // Keep the frozen execution accurate for a later reprocess:
                // a success is remembered, a failure stays pending.
                if record.is_success() {
                    let output = record.output.clone().unwrap_or_default();
                    exec.record_success(step, &output);
                    plan.dirty = true;
                }
                plan.record = Some(record);
                return Ok(());
            }
            _ => return Ok(()),
        }

        let current = exec.fan_out().is_none() && exec.current_step_id() == Some(step);
        if !branch && !current {
            return Ok(());
        }

        if record.is_success() {
            let output = record.output.clone().unwrap_or_default();
            exec.record_success(step, &output);
            plan.dirty = true;
            plan.disposition = Disposition::Completed;
            plan.push(step_event(exec, LifecycleEventKind::StepSucceeded, &record));
            plan.record = Some(record);

            if exec.awaiting_branches() {
                return Ok(());
            }
            let closed = exec.close_fan_out();
            if exec.cancel_requested() {
                return self.cancel_now(exec, plan, step, attempt);
            }

            let transition = match closed {
                Some(source) => match definition.step(&source).map(|s| &s.next) {
                    Some(Transition::Parallel { join: Some(join), .. }) => Transition::Step { step: join.clone() },
                    _ => Transition::End,
                },
                None => step_def.next.clone(),
            };
            return self.advance(exec, plan, definition, (step, attempt), transition, job.priority);
        }

        let class = record.error_class.unwrap_or(ErrorClass::System);
        let reason = match &record.error {
            Some(e) => format!("step {step} failed: {e}"),
            None => format!("step {step} failed"),
        };
        plan.push(step_event(exec, LifecycleEventKind::StepFailed, &record));
        plan.disposition = Disposition::Failed;

        let retry_allowed = class.is_retryable() && step_def.retry.should_retry(record.attempt);
        if retry_allowed && !exec.cancel_requested() {
            let (next, at) = self.retry.next_attempt(job, &step_def.retry, Utc::now())?;
            warn!(
                execution_id = %exec.id(),
                correlation_id = %exec.correlation_id(),
                step_id = %step,
                attempt = record.attempt,
                error_class = class.as_str(),
                retry_at = %at,
                "step failed; retry scheduled"
            );
            record.next_retry_at = Some(at);
            plan.record = Some(record);
            plan.jobs.push(next);
            return Ok(());
        }
        plan.record = Some(record);

        if retry_allowed {
            // Cancel wins over a retry.
            if branch {
                exec.release_branch(step);
                plan.dirty = true;
                if exec.awaiting_branches() {
                    return Ok(());
                }
                exec.close_fan_out();
            }
            return self.cancel_now(exec, plan, step, attempt);
        }

        if branch {
            exec.release_branch(step);
        }
        plan.dirty = true;

        let steps = compensation_plan(definition, exec.completed_steps());
        match steps.first().cloned() {
            Some(first) => {
                exec.begin_compensation(steps, step.clone(), reason.clone())?;
                plan.jobs.push(self.job_for(exec, StepJob::compensation(exec.id(), first.clone(), 1), job.priority)?);
                plan.compensations.push(CompensationRecord::pending(exec.id(), first));
                warn!(
                    execution_id = %exec.id(),
                    correlation_id = %exec.correlation_id(),
                    step_id = %step,
                    error_class = class.as_str(),
                    %reason,
                    "step failed permanently; compensating"
                );
            }
            None => {
                exec.dead_letter(step.clone(), reason.clone())?;
                plan.dead_letter = Some(DeadLetterEntry::for_execution(exec, Some(job.id), class));
                plan.push(
                    resolved_event(exec, LifecycleEventKind::ExecutionDeadLettered, step, attempt)
                        .with_detail(reason.clone()),
                );
                plan.disposition = Disposition::DeadLettered;
                error!(
                    execution_id = %exec.id(),
                    firm_id = %exec.tenant_id(),
                    correlation_id = %exec.correlation_id(),
                    step_id = %step,
                    error_class = class.as_str(),
                    %reason,
                    "execution dead-lettered"
                );
            }
        }
        Ok(())
    }

    /// A branch reported back after compensation began.
    fn resolve_late_branch(
        &self,
        exec: &mut WorkflowExecution,
        plan: &mut Plan,
        step_def: &StepDefinition,
        record: StepExecution,
    ) -> Result<(), EngineError> {
        let step = &step_def.id;
        let attempt = record.attempt;
        plan.dirty = true;

        if record.is_success() {
            let output = record.output.clone().unwrap_or_default();
            exec.record_success(step, &output);
            plan.push(step_event(exec, LifecycleEventKind::StepSucceeded, &record));
            plan.disposition = Disposition::Completed;
            plan.record = Some(record);

            if step_def.compensation.is_some() {
                if exec.push_late_compensation(step.clone())? {
                    plan.jobs.push(self.job_for(exec, StepJob::compensation(exec.id(), step.clone(), 1), 0)?);
                }
                plan.compensations.push(CompensationRecord::pending(exec.id(), step.clone()));
                return Ok(());
            }
        } else {
            exec.release_branch(step);
            plan.push(step_event(exec, LifecycleEventKind::StepFailed, &record));
            plan.disposition = Disposition::Failed;
            plan.record = Some(record);
        }
        self.maybe_finish_compensation(exec, plan, step, attempt)
    }

    fn advance(
        &self,
        exec: &mut WorkflowExecution,
        plan: &mut Plan,
        definition: &WorkflowDefinition,
        (from, attempt): (&StepId, u32),
        transition: Transition,
        priority: i32,
    ) -> Result<(), EngineError> {
        match transition {
            Transition::End => {
                exec.complete()?;
                plan.push(resolved_event(exec, LifecycleEventKind::ExecutionCompleted, from, attempt));
                info!(execution_id = %exec.id(), firm_id = %exec.tenant_id(), "execution completed");
            }
            Transition::Step { step } if definition.step(&step).is_some() => {
                exec.dispatch_step(step.clone())?;
                plan.jobs.push(self.job_for(exec, StepJob::forward(exec.id(), step, 1), priority)?);
            }
            Transition::Parallel { branches, .. }
                if !branches.is_empty() && branches.iter().all(|b| definition.step(b).is_some()) =>
            {
                exec.dispatch_fan_out(from.clone(), &branches)?;
                let pending: Vec<StepId> = exec
                    .fan_out()
                    .map(|f| f.pending.iter().cloned().collect())
                    .unwrap_or_default();
                for branch in pending {
                    plan.jobs.push(self.job_for(exec, StepJob::forward(exec.id(), branch, 1), priority)?);
                }
            }
            other => {
                let reason = format!("step {from} has an unusable transition {other:?}");
                exec.fail(reason.clone())?;
                plan.push(
                    resolved_event(exec, LifecycleEventKind::ExecutionFailed, from, attempt)
                        .with_detail(reason.clone()),
                );
                error!(execution_id = %exec.id(), %reason, "execution failed");
            }
        }
        plan.dirty = true;
        Ok(())
    }
}

impl JobProcessor for Orchestrator {
    #[instrument(
        skip_all,
        fields(
            job_id = %claimed.job.id,
            firm_id = %claimed.job.tenant_id,
            execution_id = %claimed.job.payload.execution_id,
            step_id = %claimed.job.payload.step_id,
            attempt = claimed.job.payload.attempt,
            correlation_id = %claimed.job.correlation_id,
        )
    )]
    fn process(&self, claimed: &ClaimedJob) -> Result<Disposition, EngineError> {
        let job = &claimed.job;
        let result = match job.payload.kind {
            StepKind::Forward => self.process_forward(claimed),
            StepKind::Compensation => self.process_compensation(claimed),
        }
        .and_then(|disposition| {
            if disposition == Disposition::Skipped {
                self.recover_follow_ups(job.tenant_id, job.payload.execution_id, job.priority)?;
            }
            Ok(disposition)
        });
        match result {
            Err(EngineError::ExecutionNotFound(id)) => {
                warn!(execution_id = %id, "job references an unknown execution; dropping it");
                Ok(Disposition::Skipped)
            }
            other => other,
        }
    }
}
