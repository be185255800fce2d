//! Processed-key store: side-effect deduplication by idempotency key.
//!
//! A handler wrapped in [`DedupingHandler`] runs at most once per key to a
//! recorded outcome. A redelivered attempt (same key) gets the recorded
//! outcome back without touching the handler; a concurrent duplicate waits
//! for the first one to finish.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use forgeflow_workflow::{IdempotencyKey, StepHandler, StepInvocation, StepOutcome};

/// Result of reserving a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyClaim {
    /// First sighting: the caller must run the side effect, then `complete`
    /// or `release`.
    Fresh,
    /// Already processed; this is the recorded outcome.
    Completed(StepOutcome),
    /// Another caller still holds the key.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessedKeyError {
    #[error("storage error: {0}")]
    Storage(String),
}

pub trait ProcessedKeyStore: Send + Sync {
    /// Reserve `key`, waiting up to `wait` while another caller holds it.
    fn reserve(&self, key: &IdempotencyKey, wait: Duration) -> Result<KeyClaim, ProcessedKeyError>;

    /// Record the outcome of a reserved key.
    fn complete(&self, key: &IdempotencyKey, outcome: StepOutcome) -> Result<(), ProcessedKeyError>;

    /// Give a reserved key back without an outcome (the next delivery runs again).
    fn release(&self, key: &IdempotencyKey) -> Result<(), ProcessedKeyError>;
}

impl<S> ProcessedKeyStore for Arc<S>
where
    S: ProcessedKeyStore + ?Sized,
{
    fn reserve(&self, key: &IdempotencyKey, wait: Duration) -> Result<KeyClaim, ProcessedKeyError> {
        (**self).reserve(key, wait)
    }

    fn complete(&self, key: &IdempotencyKey, outcome: StepOutcome) -> Result<(), ProcessedKeyError> {
        (**self).complete(key, outcome)
    }

    fn release(&self, key: &IdempotencyKey) -> Result<(), ProcessedKeyError> {
        (**self).release(key)
    }
}

#[derive(Debug, Clone)]
enum KeyState {
    InFlight,
    Done(StepOutcome),
}

/// In-memory processed-key store.
#[derive(Debug, Default)]
pub struct InMemoryProcessedKeyStore {
    keys: Mutex<HashMap<IdempotencyKey, KeyState>>,
    changed: Condvar,
}

impl InMemoryProcessedKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of keys with a recorded outcome.
    pub fn completed(&self) -> usize {
        self.keys
            .lock()
            .map(|k| k.values().filter(|s| matches!(s, KeyState::Done(_))).count())
            .unwrap_or(0)
    }

    fn poisoned() -> ProcessedKeyError {
        ProcessedKeyError::Storage("lock poisoned".to_string())
    }
}

impl ProcessedKeyStore for InMemoryProcessedKeyStore {
    fn reserve(&self, key: &IdempotencyKey, wait: Duration) -> Result<KeyClaim, ProcessedKeyError> {
        let deadline = Instant::now() + wait;
        let mut keys = self.keys.lock().map_err(|_| Self::poisoned())?;

        loop {
            match keys.get(key) {
                None => {
                    keys.insert(key.clone(), KeyState::InFlight);
                    return Ok(KeyClaim::Fresh);
                }
                Some(KeyState::Done(outcome)) => return Ok(KeyClaim::Completed(outcome.clone())),
                Some(KeyState::InFlight) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(KeyClaim::Busy);
                    }
                    let (guard, _) = self
                        .changed
                        .wait_timeout(keys, remaining)
                        .map_err(|_| Self::poisoned())?;
                    keys = guard;
                }
            }
        }
    }

    fn complete(&self, key: &IdempotencyKey, outcome: StepOutcome) -> Result<(), ProcessedKeyError> {
        let mut keys = self.keys.lock().map_err(|_| Self::poisoned())?;
        keys.insert(key.clone(), KeyState::Done(outcome));
        self.changed.notify_all();
        Ok(())
    }

    fn release(&self, key: &IdempotencyKey) -> Result<(), ProcessedKeyError> {
        let mut keys = self.keys.lock().map_err(|_| Self::poisoned())?;
        if matches!(keys.get(key), Some(KeyState::InFlight)) {
            keys.remove(key);
        }
        self.changed.notify_all();
        Ok(())
    }
}

/// Wraps a handler so each idempotency key produces at most one side effect.
///
/// Successes and permanent failures are recorded and replayed; a transient
/// failure releases the key so a redelivery tries again.
pub struct DedupingHandler<H, S> {
    inner: H,
    keys: S,
    wait: Duration,
}

impl<H, S> DedupingHandler<H, S>
where
    H: StepHandler,
    S: ProcessedKeyStore,
{
    pub fn new(inner: H, keys: S) -> Self {
        Self {
            inner,
            keys,
            wait: Duration::from_secs(5),
        }
    }

    /// How long a duplicate waits for the in-flight original.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

impl<H, S> StepHandler for DedupingHandler<H, S>
where
    H: StepHandler,
    S: ProcessedKeyStore,
{
    fn handle(&self, invocation: &StepInvocation<'_>, key: &IdempotencyKey) -> StepOutcome {
        match self.keys.reserve(key, self.wait) {
            Ok(KeyClaim::Fresh) => {}
            Ok(KeyClaim::Completed(outcome)) => {
                debug!(key = %key, step_id = %invocation.step_id, "replaying recorded outcome");
                return outcome;
            }
            Ok(KeyClaim::Busy) => {
                return StepOutcome::transient("idempotency_key_busy", format!("{key} is still in flight"));
            }
            Err(e) => {
                warn!(key = %key, error = %e, "processed-key store unavailable");
                return StepOutcome::transient("processed_key_store", e.to_string());
            }
        }

        let mut reservation = Reservation {
            keys: &self.keys,
            key,
            settled: false,
        };
        let outcome = self.inner.handle(invocation, key);
        reservation.settled = true;

        let recorded = match &outcome {
            StepOutcome::Failure(f) if f.retryable => self.keys.release(key),
            _ => self.keys.complete(key, outcome.clone()),
        };
        if let Err(e) = recorded {
            warn!(key = %key, error = %e, "failed to record processed key");
        }
        outcome
    }
}

/// Releases the key if the handler unwinds.
struct Reservation<'a, S: ProcessedKeyStore> {
    keys: &'a S,
    key: &'a IdempotencyKey,
    settled: bool,
}

impl<S: ProcessedKeyStore> Drop for Reservation<'_, S> {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.keys.release(self.key);
        }
    }
}
