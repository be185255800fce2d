//! Retry scheduler: turns a retryable failure into a delayed next-attempt job.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use forgeflow_core::DomainResult;
use forgeflow_workflow::{RetryPolicy, jittered};

use crate::jobs::Job;
use crate::jobs::types::deadline_after;

/// Source of jitter samples in `[-1.0, 1.0]`.
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

/// Uniform random jitter.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    }
}

/// Always `0.0`: delays are exactly the policy backoff.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn sample(&self) -> f64 {
        0.0
    }
}

/// Computes backoff delays and builds the next-attempt job.
///
/// A new attempt is a new job with `available_at = now + delay`; the failed
/// job itself is acked. That keeps the attempt epoch (and with it the
/// idempotency key) tied to scheduler decisions, never to redelivery.
#[derive(Clone)]
pub struct RetryScheduler {
    jitter_factor: f64,
    jitter: Arc<dyn JitterSource>,
}

impl fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("jitter_factor", &self.jitter_factor)
            .finish()
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl RetryScheduler {
    /// Random symmetric jitter of `±factor`.
    pub fn new(jitter_factor: f64) -> Self {
        Self {
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            jitter: Arc::new(RandomJitter),
        }
    }

    pub fn with_jitter<J>(mut self, jitter: J) -> Self
    where
        J: JitterSource + 'static,
    {
        self.jitter = Arc::new(jitter);
        self
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    /// Delay before the attempt that follows failed attempt `attempt`.
    pub fn delay(&self, policy: &RetryPolicy, attempt: u32) -> Duration {
        jittered(
            policy.backoff_delay(attempt),
            self.jitter_factor,
            self.jitter.sample(),
        )
    }

    /// Build the next-attempt job for `failed`, claimable at the returned instant.
    pub fn next_attempt(
        &self,
        failed: &Job,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<(Job, DateTime<Utc>)> {
        let delay = self.delay(policy, failed.payload.attempt);
        let available_at = deadline_after(now, delay);
        let job = Job::new(
            Some(failed.tenant_id),
            failed.queue.clone(),
            failed.payload.next_attempt(),
            failed.correlation_id.clone(),
        )?
        .with_priority(failed.priority)
        .keyed()
        .available_at(available_at);
        Ok((job, available_at))
    }
}
