//! Core job types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use forgeflow_core::{
    CorrelationId, DomainResult, ExecutionId, JobId, TenantId, WorkerId, require_tenant,
};
use forgeflow_workflow::{StepId, StepKind};

/// Opaque proof of a claim.
///
/// Issued by `claim`; every later `ack`/`nack`/`extend_lease` must present it.
/// A token becomes stale the moment another worker reclaims the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a job asks the worker to do: run one attempt of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepJob {
    pub execution_id: ExecutionId,
    pub step_id: StepId,
    pub kind: StepKind,
    /// Attempt number (1-based). Also the idempotency epoch.
    pub attempt: u32,
}

impl StepJob {
    pub fn forward(execution_id: ExecutionId, step_id: StepId, attempt: u32) -> Self {
        Self {
            execution_id,
            step_id,
            kind: StepKind::Forward,
            attempt,
        }
    }

    pub fn compensation(execution_id: ExecutionId, step_id: StepId, attempt: u32) -> Self {
        Self {
            execution_id,
            step_id,
            kind: StepKind::Compensation,
            attempt,
        }
    }

    /// The same step and kind, next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// Job id derived from execution, step, kind and attempt.
    ///
    /// Enqueueing the same attempt twice hits `AlreadyExists` instead of
    /// creating a second job, which makes follow-up enqueues repeatable.
    pub fn job_id(&self) -> JobId {
        let kind = match self.kind {
            StepKind::Forward => "forward",
            StepKind::Compensation => "compensation",
        };
        let name = format!("{}/{}/{}/{}", self.execution_id, self.step_id, kind, self.attempt);
        JobId::from_uuid(Uuid::new_v5(&STEP_JOB_NAMESPACE, name.as_bytes()))
    }
}

const STEP_JOB_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93b7_4d0a_8e5f_1b2c_3d4e_5f60);

/// A claimable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub queue: String,
    pub payload: StepJob,
    pub correlation_id: CorrelationId,
    /// Higher runs first.
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Not claimable before this instant (retry backoff).
    pub available_at: DateTime<Utc>,
    pub claim_token: Option<ClaimToken>,
    pub claimed_by: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Number of times the job has been claimed (deliveries).
    pub attempt_count: u32,
}

impl Job {
    /// Build a job for a firm. A missing firm id is rejected, never defaulted.
    pub fn new(
        tenant_id: Option<TenantId>,
        queue: impl Into<String>,
        payload: StepJob,
        correlation_id: CorrelationId,
    ) -> DomainResult<Self> {
        let tenant_id = require_tenant(tenant_id)?;
        let now = Utc::now();
        Ok(Self {
            id: JobId::new(),
            tenant_id,
            queue: queue.into(),
            payload,
            correlation_id,
            priority: 0,
            enqueued_at: now,
            available_at: now,
            claim_token: None,
            claimed_by: None,
            lease_expires_at: None,
            attempt_count: 0,
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Use the payload's derived id (see [`StepJob::job_id`]).
    pub fn keyed(mut self) -> Self {
        self.id = self.payload.job_id();
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = at;
        self
    }

    /// Make the job claimable only after `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.available_at = deadline_after(Utc::now(), delay);
        self
    }

    /// Whether a worker currently holds a live lease.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.claim_token.is_some() && self.lease_expires_at.is_some_and(|at| at > now)
    }

    /// Claimable: available and either unclaimed or with an expired lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now && !self.is_leased(now)
    }

    /// Claimed more than once: an earlier lease expired without an ack.
    pub fn is_redelivery(&self) -> bool {
        self.attempt_count > 1
    }
}

/// `now + delay`, saturating instead of overflowing.
pub(crate) fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A job together with the claim that reserves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub job: Job,
    pub token: ClaimToken,
    pub lease_expires_at: DateTime<Utc>,
}

impl ClaimedJob {
    pub fn id(&self) -> JobId {
        self.job.id
    }
}
