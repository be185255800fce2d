use forgeflow_events::{LifecycleEvent, LifecycleListener};
use tracing::{error, info, warn};

/// Writes every lifecycle event as one structured log line.
///
/// Alert kinds (`execution.deadlettered`, `execution.compensation_failed`,
/// `execution.failed`, `dlq.depth_exceeded`) log at `error`, failed attempts
/// at `warn`, everything else at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLifecycleListener;

impl TracingLifecycleListener {
    pub fn new() -> Self {
        Self
    }
}

macro_rules! emit {
    ($level:ident, $event:expr) => {{
        let event = $event;
        $level!(
            event = event.kind().as_str(),
            firm_id = %event.tenant_id(),
            correlation_id = %event.correlation_id(),
            execution_id = ?event.execution_id(),
            step_id = event.step_id(),
            attempt = event.attempt(),
            latency_ms = event.latency_ms(),
            detail = event.detail(),
            "lifecycle event"
        )
    }};
}

impl LifecycleListener for TracingLifecycleListener {
    fn on_event(&self, event: &LifecycleEvent) {
        use forgeflow_events::LifecycleEventKind::StepFailed;

        if event.kind().is_alert() {
            emit!(error, event);
        } else if event.kind() == StepFailed {
            emit!(warn, event);
        } else {
            emit!(info, event);
        }
    }
}
