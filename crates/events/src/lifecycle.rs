use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use forgeflow_core::{CorrelationId, ExecutionId, TenantId};

/// Kind of a lifecycle event.
///
/// The string form (`execution.started`, `step.failed`, ...) is the stable
/// name consumed by external collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEventKind {
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    #[serde(rename = "step.attempted")]
    StepAttempted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "step.succeeded")]
    StepSucceeded,
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    #[serde(rename = "execution.deadlettered")]
    ExecutionDeadLettered,
    #[serde(rename = "execution.compensated")]
    ExecutionCompensated,
    #[serde(rename = "execution.compensation_failed")]
    ExecutionCompensationFailed,
    #[serde(rename = "execution.cancelled")]
    ExecutionCancelled,
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    #[serde(rename = "execution.reprocessed")]
    ExecutionReprocessed,
    #[serde(rename = "compensation.attempted")]
    CompensationAttempted,
    #[serde(rename = "dlq.depth_exceeded")]
    DlqDepthExceeded,
}

impl LifecycleEventKind {
    pub const ALL: [LifecycleEventKind; 13] = [
        LifecycleEventKind::ExecutionStarted,
        LifecycleEventKind::StepAttempted,
        LifecycleEventKind::StepFailed,
        LifecycleEventKind::StepSucceeded,
        LifecycleEventKind::ExecutionCompleted,
        LifecycleEventKind::ExecutionDeadLettered,
        LifecycleEventKind::ExecutionCompensated,
        LifecycleEventKind::ExecutionCompensationFailed,
        LifecycleEventKind::ExecutionCancelled,
        LifecycleEventKind::ExecutionFailed,
        LifecycleEventKind::ExecutionReprocessed,
        LifecycleEventKind::CompensationAttempted,
        LifecycleEventKind::DlqDepthExceeded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEventKind::ExecutionStarted => "execution.started",
            LifecycleEventKind::StepAttempted => "step.attempted",
            LifecycleEventKind::StepFailed => "step.failed",
            LifecycleEventKind::StepSucceeded => "step.succeeded",
            LifecycleEventKind::ExecutionCompleted => "execution.completed",
            LifecycleEventKind::ExecutionDeadLettered => "execution.deadlettered",
            LifecycleEventKind::ExecutionCompensated => "execution.compensated",
            LifecycleEventKind::ExecutionCompensationFailed => "execution.compensation_failed",
            LifecycleEventKind::ExecutionCancelled => "execution.cancelled",
            LifecycleEventKind::ExecutionFailed => "execution.failed",
            LifecycleEventKind::ExecutionReprocessed => "execution.reprocessed",
            LifecycleEventKind::CompensationAttempted => "compensation.attempted",
            LifecycleEventKind::DlqDepthExceeded => "dlq.depth_exceeded",
        }
    }

    /// Terminal-failure kinds that should page an operator.
    pub fn is_alert(self) -> bool {
        matches!(
            self,
            LifecycleEventKind::ExecutionDeadLettered
                | LifecycleEventKind::ExecutionCompensationFailed
                | LifecycleEventKind::ExecutionFailed
                | LifecycleEventKind::DlqDepthExceeded
        )
    }
}

impl core::fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed lifecycle event emitted by the orchestrator.
///
/// Every event carries the firm id and correlation id. Step-level events also
/// carry the step id, the attempt number and the handler latency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    event_id: Uuid,
    kind: LifecycleEventKind,
    #[serde(rename = "firm_id")]
    tenant_id: TenantId,
    correlation_id: CorrelationId,
    execution_id: Option<ExecutionId>,
    step_id: Option<String>,
    attempt: Option<u32>,
    latency_ms: Option<u64>,
    /// Error code, failure reason or other short detail.
    detail: Option<String>,
    occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(kind: LifecycleEventKind, tenant_id: TenantId, correlation_id: CorrelationId) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            kind,
            tenant_id,
            correlation_id,
            execution_id: None,
            step_id: None,
            attempt: None,
            latency_ms: None,
            detail: None,
            occurred_at: Utc::now(),
        }
    }

    /// Execution-scoped event.
    pub fn for_execution(
        kind: LifecycleEventKind,
        tenant_id: TenantId,
        correlation_id: CorrelationId,
        execution_id: ExecutionId,
    ) -> Self {
        Self::new(kind, tenant_id, correlation_id).with_execution(execution_id)
    }

    pub fn with_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>, attempt: u32) -> Self {
        self.step_id = Some(step_id.into());
        self.attempt = Some(attempt);
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn kind(&self) -> LifecycleEventKind {
        self.kind
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn execution_id(&self) -> Option<ExecutionId> {
        self.execution_id
    }

    pub fn step_id(&self) -> Option<&str> {
        self.step_id.as_deref()
    }

    pub fn attempt(&self) -> Option<u32> {
        self.attempt
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_as_dotted_name() {
        for kind in LifecycleEventKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::Value::String(kind.as_str().to_string()));
        }
    }

    #[test]
    fn step_event_carries_required_fields() {
        let tenant = TenantId::new();
        let exec = ExecutionId::new();
        let event = LifecycleEvent::for_execution(
            LifecycleEventKind::StepSucceeded,
            tenant,
            CorrelationId::new("corr-1"),
            exec,
        )
        .with_step("post", 2)
        .with_latency_ms(15);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "step.succeeded");
        assert_eq!(json["firm_id"], serde_json::json!(tenant));
        assert_eq!(json["correlation_id"], "corr-1");
        assert_eq!(json["step_id"], "post");
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["latency_ms"], 15);
    }
}
