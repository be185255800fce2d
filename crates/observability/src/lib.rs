//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    logging::init();
}

/// Subscriber configuration (filters, JSON formatting).
pub mod logging;

/// In-process lifecycle counters.
pub mod metrics;

/// Lifecycle events as structured log lines.
pub mod listener;

pub use listener::TracingLifecycleListener;
pub use metrics::{LatencySummary, LifecycleMetrics, MetricsSnapshot};
