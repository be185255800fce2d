//! Postgres-backed job store.
//!
//! Claim is one statement: a `SELECT ... FOR UPDATE SKIP LOCKED` picks the
//! candidate rows and the surrounding `UPDATE` stamps a fresh claim token on
//! them. Competing workers skip rows another transaction has locked, so a
//! row is handed to at most one worker per lease.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation on enqueue) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! A conditional statement that matches no row (token mismatch, lease already
//! expired) maps to `ClaimLost`.
//!
//! ## Clock
//!
//! Every timestamp the claim query compares (`enqueued_at`, `available_at`,
//! `lease_expires_at`) is taken from the database clock. A job's delay is
//! sent as a relative interval so app-host skew cannot make it claimable
//! early or late.
//!
//! ## Sync bridge
//!
//! [`JobStore`] is synchronous because workers are plain threads. Calls are
//! driven on the runtime handle captured at construction, so async callers
//! go through `spawn_blocking`; the `*_async` methods are usable directly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use forgeflow_core::{CorrelationId, JobId, TenantId, WorkerId};

use super::store::{JobStore, JobStoreError};
use super::types::{ClaimToken, ClaimedJob, Job, StepJob};

/// Schema for the `jobs` table.
pub const MIGRATION: &str = include_str!("../../migrations/0001_jobs.sql");

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    /// Create a store driven by `runtime`.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Apply the `jobs` schema (idempotent).
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Drive `fut` on the captured runtime. Must not be called from inside an
    /// async task (worker threads and `spawn_blocking` closures are fine).
    fn block_on<F, T>(&self, fut: F) -> Result<T, JobStoreError>
    where
        F: Future<Output = Result<T, JobStoreError>>,
    {
        self.runtime.block_on(fut)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue), err)]
    pub async fn enqueue_async(&self, job: Job) -> Result<JobId, JobStoreError> {
        let payload = serde_json::to_value(&job.payload)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode payload: {e}")))?;

        let delay_ms = (job.available_at - job.enqueued_at).num_milliseconds().max(0);

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, tenant_id, queue, payload, correlation_id,
                priority, enqueued_at, available_at, attempt_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, now(), now() + ($7::bigint * interval '1 millisecond'), 0)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(&job.queue)
        .bind(payload)
        .bind(job.correlation_id.as_str())
        .bind(job.priority)
        .bind(delay_ms)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        Ok(job.id)
    }

    #[instrument(skip(self, worker), fields(worker = %worker), err)]
    pub async fn claim_async(
        &self,
        worker: &WorkerId,
        queue: &str,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedJob>, JobStoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT id
                FROM jobs
                WHERE queue = $1
                  AND available_at <= now()
                  AND (claim_token IS NULL OR lease_expires_at <= now())
                ORDER BY priority DESC, enqueued_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET claim_token = gen_random_uuid(),
                claimed_by = $3,
                lease_expires_at = now() + ($4::bigint * interval '1 millisecond'),
                attempt_count = j.attempt_count + 1
            FROM candidates c
            WHERE j.id = c.id
            RETURNING j.*
            "#,
        )
        .bind(queue)
        .bind(batch_size as i64)
        .bind(worker.as_str())
        .bind(lease.as_millis() as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let job = job_from_row(&row)?;
            let (Some(token), Some(lease_expires_at)) = (job.claim_token, job.lease_expires_at)
            else {
                return Err(JobStoreError::Storage(format!(
                    "claimed row {} has no claim token",
                    job.id
                )));
            };
            claimed.push(ClaimedJob {
                job,
                token,
                lease_expires_at,
            });
        }
        // RETURNING does not preserve the CTE order.
        claimed.sort_by_key(|c| (std::cmp::Reverse(c.job.priority), c.job.enqueued_at, c.job.id));
        Ok(claimed)
    }

    pub async fn ack_async(&self, job_id: JobId, token: ClaimToken) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND claim_token = $2")
            .bind(job_id.as_uuid())
            .bind(token.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ack", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::ClaimLost(job_id));
        }
        Ok(())
    }

    pub async fn nack_async(
        &self,
        job_id: JobId,
        token: ClaimToken,
        retry_after: Duration,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET claim_token = NULL,
                claimed_by = NULL,
                lease_expires_at = NULL,
                available_at = now() + ($3::bigint * interval '1 millisecond')
            WHERE id = $1 AND claim_token = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(token.as_uuid())
        .bind(retry_after.as_millis() as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("nack", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::ClaimLost(job_id));
        }
        Ok(())
    }

    pub async fn extend_lease_async(
        &self,
        job_id: JobId,
        token: ClaimToken,
        lease: Duration,
    ) -> Result<DateTime<Utc>, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = now() + ($3::bigint * interval '1 millisecond')
            WHERE id = $1 AND claim_token = $2 AND lease_expires_at > now()
            RETURNING lease_expires_at
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(token.as_uuid())
        .bind(lease.as_millis() as i64)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("extend_lease", e))?;

        match row {
            Some(row) => row
                .try_get("lease_expires_at")
                .map_err(|e| map_sqlx_error("extend_lease", e)),
            None => Err(JobStoreError::ClaimLost(job_id)),
        }
    }

    pub async fn get_async(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn depth_async(&self, queue: &str) -> Result<usize, JobStoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM jobs WHERE queue = $1")
            .bind(queue)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("depth", e))?;

        let depth: i64 = row.try_get("depth").map_err(|e| map_sqlx_error("depth", e))?;
        Ok(depth.max(0) as usize)
    }
}

impl JobStore for PostgresJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.block_on(self.enqueue_async(job))
    }

    fn claim(
        &self,
        worker: &WorkerId,
        queue: &str,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedJob>, JobStoreError> {
        self.block_on(self.claim_async(worker, queue, batch_size, lease))
    }

    fn ack(&self, job_id: JobId, token: ClaimToken) -> Result<(), JobStoreError> {
        self.block_on(self.ack_async(job_id, token))
    }

    fn nack(
        &self,
        job_id: JobId,
        token: ClaimToken,
        retry_after: Duration,
    ) -> Result<(), JobStoreError> {
        self.block_on(self.nack_async(job_id, token, retry_after))
    }

    fn extend_lease(
        &self,
        job_id: JobId,
        token: ClaimToken,
        lease: Duration,
    ) -> Result<DateTime<Utc>, JobStoreError> {
        self.block_on(self.extend_lease_async(job_id, token, lease))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.get_async(job_id))
    }

    fn depth(&self, queue: &str) -> Result<usize, JobStoreError> {
        self.block_on(self.depth_async(queue))
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let read = |e: sqlx::Error| map_sqlx_error("decode_job", e);

    let payload: serde_json::Value = row.try_get("payload").map_err(read)?;
    let payload: StepJob = serde_json::from_value(payload)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode payload: {e}")))?;
    let correlation_id: String = row.try_get("correlation_id").map_err(read)?;
    let claim_token: Option<uuid::Uuid> = row.try_get("claim_token").map_err(read)?;
    let claimed_by: Option<String> = row.try_get("claimed_by").map_err(read)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(read)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(read)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(read)?),
        queue: row.try_get("queue").map_err(read)?,
        payload,
        correlation_id: CorrelationId::new(correlation_id),
        priority: row.try_get("priority").map_err(read)?,
        enqueued_at: row.try_get("enqueued_at").map_err(read)?,
        available_at: row.try_get("available_at").map_err(read)?,
        claim_token: claim_token.map(ClaimToken::from_uuid),
        claimed_by: claimed_by.map(WorkerId::new),
        lease_expires_at: row.try_get("lease_expires_at").map_err(read)?,
        attempt_count: attempt_count.max(0) as u32,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
