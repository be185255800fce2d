//! Deterministic idempotency keys.

use serde::{Deserialize, Serialize};

use forgeflow_core::{ExecutionId, ValueObject};

use crate::definition::StepId;
use crate::step::StepKind;

/// Key a handler uses to deduplicate side effects.
///
/// Derived only from `(execution_id, step_id, kind, attempt_epoch)`. The epoch
/// changes when the retry scheduler issues a genuinely new attempt; a lease
/// expiry redelivers the same attempt and therefore the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl ValueObject for IdempotencyKey {}

impl IdempotencyKey {
    pub fn derive(execution_id: ExecutionId, step_id: &StepId, kind: StepKind, epoch: u32) -> Self {
        match kind {
            StepKind::Forward => Self(format!("{execution_id}/{step_id}/{epoch}")),
            StepKind::Compensation => Self(format!("{execution_id}/{step_id}/compensate/{epoch}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
