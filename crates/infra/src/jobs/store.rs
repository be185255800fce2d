//! Job storage: the single concurrency-control point of the engine.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use forgeflow_core::{JobId, WorkerId};

use super::types::{ClaimToken, ClaimedJob, Job, deadline_after};

/// Job store abstraction.
///
/// `claim` is an atomic conditional update: a job is handed out only when it
/// is available and either unclaimed or its lease has expired. Everything
/// after `claim` is claim-then-verify: the token must still be the current
/// one or the call fails with [`JobStoreError::ClaimLost`].
pub trait JobStore: Send + Sync {
    /// Enqueue a new job.
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Claim up to `batch_size` jobs from `queue`, ordered by priority
    /// (highest first) then enqueue time.
    fn claim(
        &self,
        worker: &WorkerId,
        queue: &str,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedJob>, JobStoreError>;

    /// Work is done; remove the job.
    fn ack(&self, job_id: JobId, token: ClaimToken) -> Result<(), JobStoreError>;

    /// Release the claim; the job becomes claimable again after `retry_after`.
    fn nack(&self, job_id: JobId, token: ClaimToken, retry_after: Duration)
    -> Result<(), JobStoreError>;

    /// Push the lease out to `now + lease`. Returns the new expiry.
    fn extend_lease(
        &self,
        job_id: JobId,
        token: ClaimToken,
        lease: Duration,
    ) -> Result<DateTime<Utc>, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Number of jobs (claimed or not) in `queue`.
    fn depth(&self, queue: &str) -> Result<usize, JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn claim(
        &self,
        worker: &WorkerId,
        queue: &str,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedJob>, JobStoreError> {
        (**self).claim(worker, queue, batch_size, lease)
    }

    fn ack(&self, job_id: JobId, token: ClaimToken) -> Result<(), JobStoreError> {
        (**self).ack(job_id, token)
    }

    fn nack(
        &self,
        job_id: JobId,
        token: ClaimToken,
        retry_after: Duration,
    ) -> Result<(), JobStoreError> {
        (**self).nack(job_id, token, retry_after)
    }

    fn extend_lease(
        &self,
        job_id: JobId,
        token: ClaimToken,
        lease: Duration,
    ) -> Result<DateTime<Utc>, JobStoreError> {
        (**self).extend_lease(job_id, token, lease)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn depth(&self, queue: &str) -> Result<usize, JobStoreError> {
        (**self).depth(queue)
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// The presented token is not the job's current claim (lease expired and
    /// another worker reclaimed it, or the job was already acked).
    #[error("claim lost for job {0}")]
    ClaimLost(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
///
/// One mutex guards the whole table so that claim is atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every stored job, oldest first.
    pub fn all(&self) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.lock()?;
        let mut all: Vec<_> = jobs.values().cloned().collect();
        all.sort_by_key(|j| (j.enqueued_at, j.id));
        Ok(all)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .lock()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".into()))
    }
}

fn verify_claim(job: &Job, token: ClaimToken) -> Result<(), JobStoreError> {
    if job.claim_token == Some(token) {
        Ok(())
    } else {
        Err(JobStoreError::ClaimLost(job.id))
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.lock()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn claim(
        &self,
        worker: &WorkerId,
        queue: &str,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedJob>, JobStoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let mut jobs = self.lock()?;
        let now = Utc::now();

        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_claimable(now))
            .map(|j| (Reverse(j.priority), j.enqueued_at, j.id))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let lease_expires_at = deadline_after(now, lease);
        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(job) = jobs.get_mut(&id) {
                let token = ClaimToken::new();
                job.claim_token = Some(token);
                job.claimed_by = Some(worker.clone());
                job.lease_expires_at = Some(lease_expires_at);
                job.attempt_count += 1;
                claimed.push(ClaimedJob {
                    job: job.clone(),
                    token,
                    lease_expires_at,
                });
            }
        }
        Ok(claimed)
    }

    fn ack(&self, job_id: JobId, token: ClaimToken) -> Result<(), JobStoreError> {
        let mut jobs = self.lock()?;
        let job = jobs.get(&job_id).ok_or(JobStoreError::ClaimLost(job_id))?;
        verify_claim(job, token)?;
        jobs.remove(&job_id);
        Ok(())
    }

    fn nack(
        &self,
        job_id: JobId,
        token: ClaimToken,
        retry_after: Duration,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::ClaimLost(job_id))?;
        verify_claim(job, token)?;
        job.claim_token = None;
        job.claimed_by = None;
        job.lease_expires_at = None;
        job.available_at = deadline_after(Utc::now(), retry_after);
        Ok(())
    }

    fn extend_lease(
        &self,
        job_id: JobId,
        token: ClaimToken,
        lease: Duration,
    ) -> Result<DateTime<Utc>, JobStoreError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::ClaimLost(job_id))?;
        verify_claim(job, token)?;
        let now = Utc::now();
        // An expired lease may already be visible to other workers; it cannot
        // be revived.
        if !job.is_leased(now) {
            return Err(JobStoreError::ClaimLost(job_id));
        }
        let expires = deadline_after(now, lease);
        job.lease_expires_at = Some(expires);
        Ok(expires)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.get(&job_id).cloned())
    }

    fn depth(&self, queue: &str) -> Result<usize, JobStoreError> {
        Ok(self.lock()?.values().filter(|j| j.queue == queue).count())
    }
}
