//! Workflow execution state machine.
//!
//! ```text
//! Pending ──► Running ──► Completed | Failed | DeadLettered | Cancelled
//!    │            └─────► Compensating ──► Compensated | CompensationFailed
//!    └──► Cancelled | Failed
//! ```
//!
//! Every mutation goes through a method that checks the transition; the
//! orchestrator never writes `status` directly.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgeflow_core::{
    CorrelationId, DomainError, DomainResult, ExecutionId, TenantId, WorkflowContext,
};

use crate::definition::{DefinitionId, StepId, WorkflowDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Compensating,
    Compensated,
    Completed,
    Failed,
    DeadLettered,
    Cancelled,
    CompensationFailed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Compensating
        )
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Compensating)
                | (Running, DeadLettered)
                | (Running, Cancelled)
                | (Compensating, Compensated)
                | (Compensating, CompensationFailed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Compensating => "compensating",
            ExecutionStatus::Compensated => "compensated",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::DeadLettered => "dead_lettered",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::CompensationFailed => "compensation_failed",
        }
    }
}

/// A step that finished successfully, in completion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step_id: StepId,
    pub completed_at: DateTime<Utc>,
}

/// An open parallel barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOut {
    /// Step whose `Parallel` transition opened the barrier.
    pub source: StepId,
    /// Branches that have not reported back yet.
    pub pending: BTreeSet<StepId>,
}

/// One run of a workflow definition for a firm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    id: ExecutionId,
    #[serde(rename = "firm_id")]
    tenant_id: TenantId,
    definition_id: DefinitionId,
    definition_version: u32,
    status: ExecutionStatus,
    current_step_id: Option<StepId>,
    context: WorkflowContext,
    correlation_id: CorrelationId,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    cancel_requested: bool,
    parent_execution_id: Option<ExecutionId>,
    completed_steps: Vec<CompletedStep>,
    fan_out: Option<FanOut>,
    compensation_queue: Vec<StepId>,
    failed_step: Option<StepId>,
    failure_reason: Option<String>,
    version: u64,
}

impl WorkflowExecution {
    /// New `Pending` execution positioned at the definition's entry step.
    pub fn create(
        tenant_id: TenantId,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
        correlation_id: CorrelationId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::new(),
            tenant_id,
            definition_id: definition.id.clone(),
            definition_version: definition.version,
            status: ExecutionStatus::Pending,
            current_step_id: Some(definition.entry.clone()),
            context,
            correlation_id,
            created_at: now,
            updated_at: now,
            cancel_requested: false,
            parent_execution_id: None,
            completed_steps: Vec::new(),
            fan_out: None,
            compensation_queue: Vec::new(),
            failed_step: None,
            failure_reason: None,
            version: 0,
        }
    }

    /// New `Pending` execution that picks up where `original` stopped.
    ///
    /// The original is left untouched; the new execution links back through
    /// `parent_execution_id` and inherits context and completed-step history.
    pub fn resume_from(original: &WorkflowExecution) -> Self {
        let now = Utc::now();
        let mut fan_out = original.fan_out.clone();
        if let (Some(f), Some(failed)) = (fan_out.as_mut(), original.failed_step.as_ref()) {
            if !original.has_completed(failed) {
                f.pending.insert(failed.clone());
            }
        }
        let resume_at = match &fan_out {
            Some(f) => Some(f.source.clone()),
            None => original
                .failed_step
                .clone()
                .or_else(|| original.current_step_id.clone()),
        };
        Self {
            id: ExecutionId::new(),
            tenant_id: original.tenant_id,
            definition_id: original.definition_id.clone(),
            definition_version: original.definition_version,
            status: ExecutionStatus::Pending,
            current_step_id: resume_at,
            context: original.context.clone(),
            correlation_id: original.correlation_id.clone(),
            created_at: now,
            updated_at: now,
            cancel_requested: false,
            parent_execution_id: Some(original.id),
            completed_steps: original.completed_steps.clone(),
            fan_out,
            compensation_queue: Vec::new(),
            failed_step: None,
            failure_reason: None,
            version: 0,
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn definition_id(&self) -> &DefinitionId {
        &self.definition_id
    }

    pub fn definition_version(&self) -> u32 {
        self.definition_version
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn current_step_id(&self) -> Option<&StepId> {
        self.current_step_id.as_ref()
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.context
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn parent_execution_id(&self) -> Option<ExecutionId> {
        self.parent_execution_id
    }

    pub fn completed_steps(&self) -> &[CompletedStep] {
        &self.completed_steps
    }

    pub fn fan_out(&self) -> Option<&FanOut> {
        self.fan_out.as_ref()
    }

    pub fn compensation_queue(&self) -> &[StepId] {
        &self.compensation_queue
    }

    pub fn failed_step(&self) -> Option<&StepId> {
        self.failed_step.as_ref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Stores stamp the persisted version after each successful write.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_completed(&self, step_id: &StepId) -> bool {
        self.completed_steps.iter().any(|c| &c.step_id == step_id)
    }

    /// Whether the barrier is still waiting on any branch.
    pub fn awaiting_branches(&self) -> bool {
        self.fan_out.as_ref().is_some_and(|f| !f.pending.is_empty())
    }

    pub fn is_pending_branch(&self, step_id: &StepId) -> bool {
        self.fan_out
            .as_ref()
            .is_some_and(|f| f.pending.contains(step_id))
    }

    fn transition(&mut self, to: ExecutionStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::illegal_transition(self.status, to));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `Pending -> Running`. Returns `true` when this call started the execution.
    pub fn start(&mut self) -> DomainResult<bool> {
        match self.status {
            ExecutionStatus::Running => Ok(false),
            _ => self.transition(ExecutionStatus::Running).map(|_| true),
        }
    }

    /// Record a successful step and merge its output into the context.
    pub fn record_success(&mut self, step_id: &StepId, output: &WorkflowContext) {
        let now = Utc::now();
        self.context = self.context.merged(output);
        self.completed_steps.push(CompletedStep {
            step_id: step_id.clone(),
            completed_at: now,
        });
        if let Some(f) = self.fan_out.as_mut() {
            f.pending.remove(step_id);
        }
        self.updated_at = now;
    }

    /// A branch resolved without succeeding (e.g. after the barrier was abandoned).
    pub fn release_branch(&mut self, step_id: &StepId) {
        if let Some(f) = self.fan_out.as_mut() {
            f.pending.remove(step_id);
        }
        self.updated_at = Utc::now();
    }

    /// Point the execution at the next sequential step.
    pub fn dispatch_step(&mut self, step_id: StepId) -> DomainResult<()> {
        self.require_status(ExecutionStatus::Running)?;
        self.current_step_id = Some(step_id);
        self.fan_out = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Open a parallel barrier over `branches`.
    pub fn dispatch_fan_out(&mut self, source: StepId, branches: &[StepId]) -> DomainResult<()> {
        self.require_status(ExecutionStatus::Running)?;
        if branches.is_empty() {
            return Err(DomainError::invariant(format!(
                "step {source} fans out to no branches"
            )));
        }
        self.current_step_id = Some(source.clone());
        self.fan_out = Some(FanOut {
            source,
            pending: branches.iter().cloned().collect(),
        });
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Close a drained barrier, returning the step that opened it.
    pub fn close_fan_out(&mut self) -> Option<StepId> {
        match &self.fan_out {
            Some(f) if f.pending.is_empty() => self.fan_out.take().map(|f| f.source),
            _ => None,
        }
    }

    pub fn complete(&mut self) -> DomainResult<()> {
        self.transition(ExecutionStatus::Completed)
    }

    /// Enter compensation with `plan` (reverse completion order).
    pub fn begin_compensation(
        &mut self,
        plan: Vec<StepId>,
        failed_step: StepId,
        reason: impl Into<String>,
    ) -> DomainResult<()> {
        if plan.is_empty() {
            return Err(DomainError::invariant("compensation plan is empty"));
        }
        self.transition(ExecutionStatus::Compensating)?;
        self.compensation_queue = plan;
        self.failed_step = Some(failed_step);
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn next_compensation(&self) -> Option<&StepId> {
        self.compensation_queue.first()
    }

    pub fn compensation_succeeded(&mut self, step_id: &StepId) {
        self.compensation_queue.retain(|s| s != step_id);
        self.updated_at = Utc::now();
    }

    /// A branch succeeded after compensation began; undo it next.
    ///
    /// The head of the queue is the compensation currently dispatched, so the
    /// late step goes right behind it. Returns `true` when the queue was empty
    /// and the caller must dispatch the step itself.
    pub fn push_late_compensation(&mut self, step_id: StepId) -> DomainResult<bool> {
        self.require_status(ExecutionStatus::Compensating)?;
        let idle = self.compensation_queue.is_empty();
        if idle {
            self.compensation_queue.push(step_id);
        } else {
            self.compensation_queue.insert(1, step_id);
        }
        self.updated_at = Utc::now();
        Ok(idle)
    }

    /// `Compensating -> Compensated` once nothing is left to undo or wait for.
    pub fn finish_compensation(&mut self) -> DomainResult<()> {
        if !self.compensation_queue.is_empty() || self.awaiting_branches() {
            return Err(DomainError::invariant(
                "compensation finished with work outstanding",
            ));
        }
        self.transition(ExecutionStatus::Compensated)
    }

    pub fn compensation_failed(&mut self, reason: impl Into<String>) -> DomainResult<()> {
        self.transition(ExecutionStatus::CompensationFailed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Freeze the execution pending manual action.
    pub fn dead_letter(&mut self, failed_step: StepId, reason: impl Into<String>) -> DomainResult<()> {
        self.transition(ExecutionStatus::DeadLettered)?;
        self.failed_step = Some(failed_step);
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Engine-level failure (the definition can no longer be followed).
    pub fn fail(&mut self, reason: impl Into<String>) -> DomainResult<()> {
        self.transition(ExecutionStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Flag a cooperative cancel. Returns `false` when the execution is already
    /// compensating or terminal.
    pub fn request_cancel(&mut self) -> bool {
        match self.status {
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                self.cancel_requested = true;
                self.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) -> DomainResult<()> {
        self.transition(ExecutionStatus::Cancelled)
    }

    fn require_status(&self, status: ExecutionStatus) -> DomainResult<()> {
        if self.status == status {
            Ok(())
        } else {
            Err(DomainError::invariant(format!(
                "execution {} is {}, expected {}",
                self.id,
                self.status.as_str(),
                status.as_str()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepDefinition;
    use proptest::prelude::*;
    use serde_json::json;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new("engagement", 1, "a")
            .with_step(StepDefinition::new("a", "t").then("b"))
            .with_step(StepDefinition::new("b", "t"))
    }

    fn execution() -> WorkflowExecution {
        WorkflowExecution::create(
            TenantId::new(),
            &definition(),
            WorkflowContext::new(),
            CorrelationId::generate(),
        )
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut exec = execution();
        assert_eq!(exec.status(), ExecutionStatus::Pending);
        assert_eq!(exec.current_step_id(), Some(&StepId::new("a")));

        assert!(exec.start().unwrap());
        assert!(!exec.start().unwrap());

        exec.record_success(&StepId::new("a"), &WorkflowContext::new().with("x", json!(1)));
        exec.dispatch_step(StepId::new("b")).unwrap();
        exec.record_success(&StepId::new("b"), &WorkflowContext::new());
        exec.complete().unwrap();

        assert_eq!(exec.status(), ExecutionStatus::Completed);
        assert_eq!(exec.context().get("x"), Some(&json!(1)));
        assert_eq!(exec.completed_steps().len(), 2);
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut exec = execution();
        exec.start().unwrap();
        exec.dead_letter(StepId::new("a"), "boom").unwrap();

        assert!(exec.complete().is_err());
        assert!(exec.cancel().is_err());
        assert!(!exec.request_cancel());
        assert_eq!(exec.status(), ExecutionStatus::DeadLettered);
    }

    #[test]
    fn barrier_closes_only_when_all_branches_report() {
        let mut exec = execution();
        exec.start().unwrap();
        let branches = [StepId::new("x"), StepId::new("y")];
        exec.dispatch_fan_out(StepId::new("a"), &branches).unwrap();

        exec.record_success(&branches[0], &WorkflowContext::new());
        assert!(exec.awaiting_branches());
        assert!(exec.close_fan_out().is_none());

        exec.record_success(&branches[1], &WorkflowContext::new());
        assert_eq!(exec.close_fan_out(), Some(StepId::new("a")));
        assert!(exec.fan_out().is_none());
    }

    #[test]
    fn compensation_cannot_finish_while_branches_pending() {
        let mut exec = execution();
        exec.start().unwrap();
        exec.dispatch_fan_out(StepId::new("a"), &[StepId::new("x"), StepId::new("y")])
            .unwrap();
        exec.record_success(&StepId::new("x"), &WorkflowContext::new());
        exec.begin_compensation(vec![StepId::new("x")], StepId::new("y"), "declined")
            .unwrap();
        exec.compensation_succeeded(&StepId::new("x"));
        exec.release_branch(&StepId::new("z"));

        // `y` still pending.
        assert!(exec.finish_compensation().is_err());
        exec.release_branch(&StepId::new("y"));
        exec.finish_compensation().unwrap();
        assert_eq!(exec.status(), ExecutionStatus::Compensated);
    }

    #[test]
    fn resume_links_parent_and_restarts_at_failed_step() {
        let mut exec = execution();
        exec.start().unwrap();
        exec.record_success(&StepId::new("a"), &WorkflowContext::new().with("k", json!("v")));
        exec.dispatch_step(StepId::new("b")).unwrap();
        exec.dead_letter(StepId::new("b"), "rejected").unwrap();

        let resumed = WorkflowExecution::resume_from(&exec);
        assert_ne!(resumed.id(), exec.id());
        assert_eq!(resumed.parent_execution_id(), Some(exec.id()));
        assert_eq!(resumed.status(), ExecutionStatus::Pending);
        assert_eq!(resumed.current_step_id(), Some(&StepId::new("b")));
        assert_eq!(resumed.context().get("k"), Some(&json!("v")));
        assert_eq!(exec.status(), ExecutionStatus::DeadLettered);
    }

    #[test]
    fn late_branch_compensation_queues_behind_dispatched_head() {
        let mut exec = execution();
        exec.start().unwrap();
        exec.dispatch_fan_out(StepId::new("a"), &[StepId::new("x"), StepId::new("y")])
            .unwrap();
        exec.record_success(&StepId::new("a"), &WorkflowContext::new());
        exec.release_branch(&StepId::new("x"));
        exec.begin_compensation(vec![StepId::new("a")], StepId::new("x"), "declined")
            .unwrap();

        assert!(!exec.push_late_compensation(StepId::new("y")).unwrap());
        assert_eq!(
            exec.compensation_queue(),
            &[StepId::new("a"), StepId::new("y")]
        );

        exec.compensation_succeeded(&StepId::new("a"));
        exec.compensation_succeeded(&StepId::new("y"));
        assert!(exec.push_late_compensation(StepId::new("z")).unwrap());
    }

    #[test]
    fn resume_after_branch_failure_reopens_the_failed_branch() {
        let mut exec = execution();
        exec.start().unwrap();
        exec.dispatch_fan_out(StepId::new("a"), &[StepId::new("x"), StepId::new("y")])
            .unwrap();
        exec.record_success(&StepId::new("y"), &WorkflowContext::new());
        exec.release_branch(&StepId::new("x"));
        exec.dead_letter(StepId::new("x"), "rejected").unwrap();

        let resumed = WorkflowExecution::resume_from(&exec);
        let pending: Vec<_> = resumed.fan_out().unwrap().pending.iter().cloned().collect();
        assert_eq!(pending, vec![StepId::new("x")]);
        assert_eq!(resumed.current_step_id(), Some(&StepId::new("a")));
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Start,
        Complete,
        Compensate,
        FinishCompensation,
        CompensationFailed,
        DeadLetter,
        Fail,
        Cancel,
    }

    fn apply(exec: &mut WorkflowExecution, op: Op) {
        let _ = match op {
            Op::Start => exec.start().map(|_| ()),
            Op::Complete => exec.complete(),
            Op::Compensate => {
                exec.begin_compensation(vec![StepId::new("a")], StepId::new("a"), "r")
            }
            Op::FinishCompensation => {
                if let Some(s) = exec.next_compensation().cloned() {
                    exec.compensation_succeeded(&s);
                }
                exec.finish_compensation()
            }
            Op::CompensationFailed => exec.compensation_failed("r"),
            Op::DeadLetter => exec.dead_letter(StepId::new("a"), "r"),
            Op::Fail => exec.fail("r"),
            Op::Cancel => exec.cancel(),
        };
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            Just(Op::Complete),
            Just(Op::Compensate),
            Just(Op::FinishCompensation),
            Just(Op::CompensationFailed),
            Just(Op::DeadLetter),
            Just(Op::Fail),
            Just(Op::Cancel),
        ]
    }

    proptest! {
        /// Property: once terminal, an execution keeps that exact status.
        #[test]
        fn terminal_status_is_final(ops in prop::collection::vec(op_strategy(), 1..30)) {
            let mut exec = execution();
            let mut terminal: Option<ExecutionStatus> = None;
            for op in ops {
                apply(&mut exec, op);
                if let Some(t) = terminal {
                    prop_assert_eq!(exec.status(), t);
                } else if exec.is_terminal() {
                    terminal = Some(exec.status());
                }
            }
        }
    }
}
