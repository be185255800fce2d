//! Postgres-backed execution store.
//!
//! Executions are stored as JSONB bodies next to a `version` column. Every
//! write runs in one transaction that first locks the execution row
//! (`SELECT ... FOR UPDATE`), then checks the expected version and the
//! attempt sequence, then updates the row and inserts the step record. A
//! rejected check returns early and the dropped transaction rolls back, so
//! nothing is written when either half is refused.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | ExecutionStoreError |
//! |------------|----------------------|---------------------|
//! | Database (unique violation on create) | `23505` | `AlreadyExists` |
//! | Database (unique violation on a step record) | `23505` | `DuplicateAttempt` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! Calls block on the runtime handle captured at construction, like the
//! Postgres job store.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;

use forgeflow_core::{ExecutionId, ExpectedVersion, TenantId};
use forgeflow_workflow::{CompensationRecord, StepExecution, StepKind, WorkflowExecution};

use super::{ExecutionStore, ExecutionStoreError, check_attempt};

/// Schema for executions, step records and compensation records.
pub const MIGRATION: &str = include_str!("../../migrations/0002_executions.sql");

#[derive(Debug, Clone)]
pub struct PostgresExecutionStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Apply the execution schema (idempotent).
    pub async fn migrate(&self) -> Result<(), ExecutionStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T, ExecutionStoreError>
    where
        F: Future<Output = Result<T, ExecutionStoreError>>,
    {
        self.runtime.block_on(fut)
    }

    #[instrument(skip(self, execution), fields(execution_id = %execution.id()), err)]
    pub async fn create_async(&self, execution: WorkflowExecution) -> Result<WorkflowExecution, ExecutionStoreError> {
        let stored = execution.with_version(1);
        sqlx::query(
            r#"
            INSERT INTO executions (id, tenant_id, version, status, body, created_at, updated_at)
            VALUES ($1, $2, 1, $3, $4, $5, $6)
            "#,
        )
        .bind(stored.id().as_uuid())
        .bind(stored.tenant_id().as_uuid())
        .bind(stored.status().as_str())
        .bind(encode("execution", &stored)?)
        .bind(stored.created_at())
        .bind(stored.updated_at())
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if has_sql_state(&e, UNIQUE_VIOLATION) {
                ExecutionStoreError::AlreadyExists(stored.id())
            } else {
                map_sqlx_error("create", e)
            }
        })?;
        Ok(stored)
    }

    pub async fn get_async(&self, tenant_id: TenantId, id: ExecutionId) -> Result<WorkflowExecution, ExecutionStoreError> {
        let row = sqlx::query("SELECT version, body FROM executions WHERE id = $1 AND tenant_id = $2")
            .bind(id.as_uuid())
            .bind(tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        match row {
            Some(row) => execution_from_row(&row),
            None => Err(ExecutionStoreError::NotFound(id)),
        }
    }

    #[instrument(
        skip(self, execution, record),
        fields(execution_id = %execution.id(), has_record = record.is_some()),
        err
    )]
    pub async fn commit_step_async(
        &self,
        execution: WorkflowExecution,
        expected: ExpectedVersion,
        record: Option<StepExecution>,
    ) -> Result<WorkflowExecution, ExecutionStoreError> {
        if let Some(record) = &record {
            if record.execution_id != execution.id() {
                return Err(ExecutionStoreError::Storage(format!(
                    "step record for {} committed with execution {}",
                    record.execution_id,
                    execution.id()
                )));
            }
        }

        let mut tx = self.begin().await?;
        let (tenant_id, current) = lock_execution(&mut tx, execution.id()).await?;
        if tenant_id != execution.tenant_id() {
            return Err(ExecutionStoreError::NotFound(execution.id()));
        }
        if !expected.matches(current) {
            return Err(ExecutionStoreError::Conflict(format!(
                "expected {expected:?}, found {current}"
            )));
        }
        if let Some(record) = &record {
            insert_step(&mut tx, tenant_id, record).await?;
        }

        let stored = execution.with_version(current + 1);
        sqlx::query(
            r#"
            UPDATE executions
            SET version = $2, status = $3, body = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(stored.id().as_uuid())
        .bind(stored.version() as i64)
        .bind(stored.status().as_str())
        .bind(encode("execution", &stored)?)
        .bind(stored.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_execution", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    pub async fn append_step_async(&self, record: StepExecution) -> Result<(), ExecutionStoreError> {
        let mut tx = self.begin().await?;
        let (tenant_id, _) = lock_execution(&mut tx, record.execution_id).await?;
        insert_step(&mut tx, tenant_id, &record).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    pub async fn steps_async(&self, tenant_id: TenantId, id: ExecutionId) -> Result<Vec<StepExecution>, ExecutionStoreError> {
        self.require_execution(tenant_id, id).await?;
        let rows = sqlx::query("SELECT body FROM step_executions WHERE execution_id = $1 ORDER BY seq")
            .bind(id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("steps", e))?;
        rows.iter().map(|row| decode(row, "step record")).collect()
    }

    pub async fn upsert_compensation_async(&self, record: CompensationRecord) -> Result<(), ExecutionStoreError> {
        sqlx::query(
            r#"
            INSERT INTO compensation_records (execution_id, step_id, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (execution_id, step_id) DO UPDATE SET body = EXCLUDED.body
            "#,
        )
        .bind(record.execution_id.as_uuid())
        .bind(record.step_id.as_str())
        .bind(encode("compensation record", &record)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if has_sql_state(&e, FOREIGN_KEY_VIOLATION) {
                ExecutionStoreError::NotFound(record.execution_id)
            } else {
                map_sqlx_error("upsert_compensation", e)
            }
        })?;
        Ok(())
    }

    pub async fn compensations_async(
        &self,
        tenant_id: TenantId,
        id: ExecutionId,
    ) -> Result<Vec<CompensationRecord>, ExecutionStoreError> {
        self.require_execution(tenant_id, id).await?;
        let rows = sqlx::query("SELECT body FROM compensation_records WHERE execution_id = $1 ORDER BY seq")
            .bind(id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("compensations", e))?;
        rows.iter().map(|row| decode(row, "compensation record")).collect()
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, ExecutionStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Another firm's execution is reported as not found.
    async fn require_execution(&self, tenant_id: TenantId, id: ExecutionId) -> Result<(), ExecutionStoreError> {
        let found = sqlx::query("SELECT 1 FROM executions WHERE id = $1 AND tenant_id = $2")
            .bind(id.as_uuid())
            .bind(tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("require_execution", e))?;
        found.map(|_| ()).ok_or(ExecutionStoreError::NotFound(id))
    }
}

impl ExecutionStore for PostgresExecutionStore {
    fn create(&self, execution: WorkflowExecution) -> Result<WorkflowExecution, ExecutionStoreError> {
        self.block_on(self.create_async(execution))
    }

    fn get(&self, tenant_id: TenantId, id: ExecutionId) -> Result<WorkflowExecution, ExecutionStoreError> {
        self.block_on(self.get_async(tenant_id, id))
    }

    fn update(
        &self,
        execution: WorkflowExecution,
        expected: ExpectedVersion,
    ) -> Result<WorkflowExecution, ExecutionStoreError> {
        self.block_on(self.commit_step_async(execution, expected, None))
    }

    fn append_step(&self, record: StepExecution) -> Result<(), ExecutionStoreError> {
        self.block_on(self.append_step_async(record))
    }

    fn commit_step(
        &self,
        execution: WorkflowExecution,
        expected: ExpectedVersion,
        record: Option<StepExecution>,
    ) -> Result<WorkflowExecution, ExecutionStoreError> {
        self.block_on(self.commit_step_async(execution, expected, record))
    }

    fn steps(&self, tenant_id: TenantId, id: ExecutionId) -> Result<Vec<StepExecution>, ExecutionStoreError> {
        self.block_on(self.steps_async(tenant_id, id))
    }

    fn upsert_compensation(&self, record: CompensationRecord) -> Result<(), ExecutionStoreError> {
        self.block_on(self.upsert_compensation_async(record))
    }

    fn compensations(
        &self,
        tenant_id: TenantId,
        id: ExecutionId,
    ) -> Result<Vec<CompensationRecord>, ExecutionStoreError> {
        self.block_on(self.compensations_async(tenant_id, id))
    }
}

/// Lock the execution row for the rest of the transaction.
async fn lock_execution(
    tx: &mut Transaction<'static, Postgres>,
    id: ExecutionId,
) -> Result<(TenantId, u64), ExecutionStoreError> {
    let row = sqlx::query("SELECT tenant_id, version FROM executions WHERE id = $1 FOR UPDATE")
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_execution", e))?
        .ok_or(ExecutionStoreError::NotFound(id))?;

    let tenant_id: uuid::Uuid = row.try_get("tenant_id").map_err(|e| map_sqlx_error("lock_execution", e))?;
    let version: i64 = row.try_get("version").map_err(|e| map_sqlx_error("lock_execution", e))?;
    Ok((TenantId::from_uuid(tenant_id), version.max(0) as u64))
}

/// Append `record` to an execution whose row this transaction holds locked.
async fn insert_step(
    tx: &mut Transaction<'static, Postgres>,
    tenant_id: TenantId,
    record: &StepExecution,
) -> Result<(), ExecutionStoreError> {
    if record.tenant_id != tenant_id {
        return Err(ExecutionStoreError::TenantIsolation(format!(
            "step record for {} carries another firm id",
            record.execution_id
        )));
    }

    let recorded: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM step_executions WHERE execution_id = $1 AND step_id = $2 AND kind = $3",
    )
    .bind(record.execution_id.as_uuid())
    .bind(record.step_id.as_str())
    .bind(kind_str(record.kind))
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("count_attempts", e))?;
    check_attempt(recorded.max(0) as u32, record)?;

    sqlx::query(
        r#"
        INSERT INTO step_executions (execution_id, tenant_id, step_id, kind, attempt, body)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(record.execution_id.as_uuid())
    .bind(record.tenant_id.as_uuid())
    .bind(record.step_id.as_str())
    .bind(kind_str(record.kind))
    .bind(record.attempt as i32)
    .bind(encode("step record", record)?)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if has_sql_state(&e, UNIQUE_VIOLATION) {
            ExecutionStoreError::DuplicateAttempt {
                execution_id: record.execution_id,
                step_id: record.step_id.clone(),
                kind: record.kind,
                attempt: record.attempt,
            }
        } else {
            map_sqlx_error("insert_step", e)
        }
    })?;
    Ok(())
}

fn kind_str(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Forward => "forward",
        StepKind::Compensation => "compensation",
    }
}

fn execution_from_row(row: &PgRow) -> Result<WorkflowExecution, ExecutionStoreError> {
    let version: i64 = row.try_get("version").map_err(|e| map_sqlx_error("decode_execution", e))?;
    let execution: WorkflowExecution = decode(row, "execution")?;
    Ok(execution.with_version(version.max(0) as u64))
}

fn encode<T: Serialize>(what: &str, value: &T) -> Result<serde_json::Value, ExecutionStoreError> {
    serde_json::to_value(value).map_err(|e| ExecutionStoreError::Storage(format!("failed to encode {what}: {e}")))
}

fn decode<T: DeserializeOwned>(row: &PgRow, what: &str) -> Result<T, ExecutionStoreError> {
    let body: serde_json::Value = row.try_get("body").map_err(|e| map_sqlx_error("decode", e))?;
    serde_json::from_value(body).map_err(|e| ExecutionStoreError::Storage(format!("failed to decode {what}: {e}")))
}

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

fn has_sql_state(err: &sqlx::Error, code: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(code),
        _ => false,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ExecutionStoreError {
    match err {
        sqlx::Error::Database(db_err) => ExecutionStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            ExecutionStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => ExecutionStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
