//! Step attempt records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgeflow_core::{ExecutionId, TenantId, WorkflowContext};

use crate::definition::StepId;
use crate::handler::StepError;
use crate::idempotency::IdempotencyKey;
use crate::retry::ErrorClass;

/// Whether an attempt ran the step itself or its compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Forward,
    Compensation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

/// One resolved attempt of a step.
///
/// Written once, when the attempt resolves; `(execution_id, step_id, kind,
/// attempt)` is unique and attempts are gapless starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub execution_id: ExecutionId,
    #[serde(rename = "firm_id")]
    pub tenant_id: TenantId,
    pub step_id: StepId,
    pub kind: StepKind,
    pub attempt: u32,
    pub status: StepStatus,
    pub idempotency_key: IdempotencyKey,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub output: Option<WorkflowContext>,
    pub error: Option<StepError>,
    pub error_class: Option<ErrorClass>,
    /// When the follow-up attempt becomes claimable, if one was scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn latency_ms(&self) -> u64 {
        (self.completed_at - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}
