//! Retry policies and error classification.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handler::StepFailure;

/// Error taxonomy used by the orchestrator to pick a failure path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network/timeout-class failure: retried per policy.
    Transient,
    /// Validation or business rejection: never retried.
    Permanent,
    /// Storage/infrastructure fault: retried with backoff.
    System,
    /// A compensation action gave up: terminal.
    Compensation,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::System)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::System => "system",
            ErrorClass::Compensation => "compensation",
        }
    }
}

/// Decides whether a handler-reported failure is transient or permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorClassifier {
    /// Trust the handler's `retryable` flag.
    #[default]
    HandlerFlag,
    /// Trust the flag, except these error codes are always permanent.
    PermanentCodes { codes: Vec<String> },
    /// Only these error codes are transient; everything else is permanent.
    TransientCodes { codes: Vec<String> },
    /// Every failure is permanent.
    NeverRetry,
}

impl ErrorClassifier {
    pub fn classify(&self, failure: &StepFailure) -> ErrorClass {
        let code = failure.error.code.as_str();
        let transient = match self {
            ErrorClassifier::HandlerFlag => failure.retryable,
            ErrorClassifier::PermanentCodes { codes } => {
                failure.retryable && !codes.iter().any(|c| c == code)
            }
            ErrorClassifier::TransientCodes { codes } => codes.iter().any(|c| c == code),
            ErrorClassifier::NeverRetry => false,
        };

        if transient {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }
}

/// Per-step retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts allowed, first try included (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(with = "crate::duration_ms")]
    pub base_delay: Duration,
    /// Maximum delay cap.
    #[serde(with = "crate::duration_ms")]
    pub max_delay: Duration,
    pub classifier: ErrorClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            classifier: ErrorClassifier::HandlerFlag,
        }
    }
}

impl RetryPolicy {
    /// A policy that allows exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Exponential backoff policy with the default classifier.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            classifier: ErrorClassifier::HandlerFlag,
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Un-jittered delay after the failed attempt `attempt` (1-indexed):
    /// `min(base_delay * 2^(attempt-1), max_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = (attempt - 1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt may follow the failed attempt `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Apply symmetric jitter to `delay`.
///
/// `unit` is a sample in `[-1.0, 1.0]`; the result lies within
/// `delay * (1 ± factor)`.
pub fn jittered(delay: Duration, factor: f64, unit: f64) -> Duration {
    let factor = factor.clamp(0.0, 1.0);
    let unit = unit.clamp(-1.0, 1.0);
    let ms = delay.as_secs_f64() * 1000.0;
    let adjusted = (ms + ms * factor * unit).max(0.0);
    Duration::from_micros((adjusted * 1000.0).round() as u64)
}
