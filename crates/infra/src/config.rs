//! Engine configuration loaded from `FORGEFLOW_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::jobs::WorkerPoolConfig;

/// Runtime settings for the orchestrator and the worker pool.
///
/// Durations are kept in milliseconds so the struct round-trips through
/// env vars and JSON unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: String,
    pub workers: usize,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub max_idle_backoff_ms: u64,
    pub lease_ms: u64,
    pub heartbeat_ms: u64,
    /// Deliveries of one attempt before it fails as a system error.
    pub max_deliveries: u32,
    /// Per-firm DLQ depth that raises `dlq.depth_exceeded`.
    pub dlq_alert_threshold: usize,
    pub jitter: f64,
    pub database_url: Option<String>,
    pub definitions_path: Option<String>,
    pub bind: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: "workflow-steps".to_string(),
            workers: 4,
            batch_size: 1,
            poll_interval_ms: 100,
            max_idle_backoff_ms: 2_000,
            lease_ms: 30_000,
            heartbeat_ms: 10_000,
            max_deliveries: 5,
            dlq_alert_threshold: 100,
            jitter: 0.2,
            database_url: None,
            definitions_path: None,
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

impl EngineConfig {
    /// Read the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup; unset or malformed values fall back to
    /// the defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            queue: lookup("FORGEFLOW_QUEUE").unwrap_or(d.queue),
            workers: parsed(&lookup, "FORGEFLOW_WORKERS", d.workers),
            batch_size: parsed(&lookup, "FORGEFLOW_BATCH_SIZE", d.batch_size),
            poll_interval_ms: parsed(&lookup, "FORGEFLOW_POLL_INTERVAL_MS", d.poll_interval_ms),
            max_idle_backoff_ms: parsed(&lookup, "FORGEFLOW_MAX_IDLE_BACKOFF_MS", d.max_idle_backoff_ms),
            lease_ms: parsed(&lookup, "FORGEFLOW_LEASE_MS", d.lease_ms),
            heartbeat_ms: parsed(&lookup, "FORGEFLOW_HEARTBEAT_MS", d.heartbeat_ms),
            max_deliveries: parsed(&lookup, "FORGEFLOW_MAX_DELIVERIES", d.max_deliveries),
            dlq_alert_threshold: parsed(&lookup, "FORGEFLOW_DLQ_ALERT_THRESHOLD", d.dlq_alert_threshold),
            jitter: parsed(&lookup, "FORGEFLOW_JITTER", d.jitter),
            database_url: lookup("DATABASE_URL"),
            definitions_path: lookup("FORGEFLOW_DEFINITIONS"),
            bind: lookup("FORGEFLOW_BIND").unwrap_or(d.bind),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_idle_backoff(&self) -> Duration {
        Duration::from_millis(self.max_idle_backoff_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_queue(self.queue.clone())
            .with_workers(self.workers)
            .with_batch_size(self.batch_size)
            .with_poll_interval(self.poll_interval())
            .with_max_idle_backoff(self.max_idle_backoff())
            .with_lease(self.lease())
            .with_heartbeat_interval(self.heartbeat_interval())
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    match lookup(name) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, default = %default, "invalid value; using default");
            default
        }),
    }
}
