//! Compensation records and planning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgeflow_core::ExecutionId;

use crate::definition::{StepId, WorkflowDefinition};
use crate::execution::CompletedStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Progress of one step's compensation within an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub execution_id: ExecutionId,
    pub step_id: StepId,
    pub status: CompensationStatus,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl CompensationRecord {
    pub fn pending(execution_id: ExecutionId, step_id: StepId) -> Self {
        Self {
            execution_id,
            step_id,
            status: CompensationStatus::Pending,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn resolved(mut self, status: CompensationStatus, attempts: u32) -> Self {
        self.status = status;
        self.attempts = attempts;
        self.updated_at = Utc::now();
        self
    }
}

/// Steps to compensate, in strict reverse completion order.
///
/// Only steps that declare a compensation are included.
pub fn compensation_plan(definition: &WorkflowDefinition, completed: &[CompletedStep]) -> Vec<StepId> {
    completed
        .iter()
        .rev()
        .filter(|c| definition.has_compensation(&c.step_id))
        .map(|c| c.step_id.clone())
        .collect()
}
