use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use forgeflow_events::{LifecycleEvent, LifecycleEventKind, LifecycleListener};

const KINDS: usize = LifecycleEventKind::ALL.len();

fn slot(kind: LifecycleEventKind) -> usize {
    LifecycleEventKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(0)
}

/// Lock-free counters per lifecycle event kind, plus handler latency of
/// resolved step attempts.
///
/// Register it as a listener and read it with [`LifecycleMetrics::snapshot`].
#[derive(Debug)]
pub struct LifecycleMetrics {
    counts: [AtomicU64; KINDS],
    latency_count: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_max_ms: AtomicU64,
}

impl Default for LifecycleMetrics {
    fn default() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_count: AtomicU64::new(0),
            latency_total_ms: AtomicU64::new(0),
            latency_max_ms: AtomicU64::new(0),
        }
    }
}

/// Point-in-time copy of [`LifecycleMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Event name (`step.failed`, ...) to count; every kind is present.
    pub events: BTreeMap<&'static str, u64>,
    pub step_latency: LatencySummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl LatencySummary {
    pub fn mean_ms(&self) -> Option<u64> {
        self.total_ms.checked_div(self.count)
    }
}

impl MetricsSnapshot {
    pub fn count(&self, kind: LifecycleEventKind) -> u64 {
        self.events.get(kind.as_str()).copied().unwrap_or(0)
    }
}

impl LifecycleMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: LifecycleEventKind) -> u64 {
        self.counts[slot(kind)].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let events = LifecycleEventKind::ALL
            .iter()
            .map(|kind| (kind.as_str(), self.count(*kind)))
            .collect();
        MetricsSnapshot {
            events,
            step_latency: LatencySummary {
                count: self.latency_count.load(Ordering::Relaxed),
                total_ms: self.latency_total_ms.load(Ordering::Relaxed),
                max_ms: self.latency_max_ms.load(Ordering::Relaxed),
            },
        }
    }
}

impl LifecycleListener for LifecycleMetrics {
    fn on_event(&self, event: &LifecycleEvent) {
        self.counts[slot(event.kind())].fetch_add(1, Ordering::Relaxed);

        if let Some(latency) = event.latency_ms() {
            self.latency_count.fetch_add(1, Ordering::Relaxed);
            self.latency_total_ms.fetch_add(latency, Ordering::Relaxed);
            self.latency_max_ms.fetch_max(latency, Ordering::Relaxed);
        }
    }
}
