//! Postgres-backed dead letter queue.
//!
//! Entries and reprocess records are JSONB bodies keyed by firm. Writes that
//! change a firm's depth (`write`, `record_reprocess`) take a
//! transaction-scoped advisory lock on the firm first, so the depth `write`
//! reports around its insert is exact even with many writers.
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

use forgeflow_core::{DeadLetterId, ExecutionId, TenantId};

use super::{
    DeadLetterEntry, DeadLetterError, DeadLetterListing, DeadLetterStore, DepthChange, ReprocessRecord,
};

/// Schema for DLQ entries and the reprocess log.
pub const MIGRATION: &str = include_str!("../../migrations/0003_dead_letters.sql");

const DEPTH_QUERY: &str = r#"
    SELECT COUNT(*)
    FROM dead_letters d
    WHERE d.tenant_id = $1
      AND NOT EXISTS (SELECT 1 FROM dead_letter_reprocesses r WHERE r.dead_letter_id = d.id)
"#;

#[derive(Debug, Clone)]
pub struct PostgresDeadLetterStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Apply the DLQ schema (idempotent).
    pub async fn migrate(&self) -> Result<(), DeadLetterError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T, DeadLetterError>
    where
        F: Future<Output = Result<T, DeadLetterError>>,
    {
        self.runtime.block_on(fut)
    }

    #[instrument(skip(self, entry), fields(dead_letter_id = %entry.id, firm_id = %entry.tenant_id), err)]
    pub async fn write_async(&self, entry: DeadLetterEntry) -> Result<DepthChange, DeadLetterError> {
        let mut tx = self.begin_for(entry.tenant_id).await?;
        let before = depth_in(&mut tx, entry.tenant_id).await?;

        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, tenant_id, execution_id, body, failed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.tenant_id.as_uuid())
        .bind(entry.execution_id.as_uuid())
        .bind(encode("dead letter entry", &entry)?)
        .bind(entry.failed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DeadLetterError::AlreadyExists(entry.id)
            } else {
                map_sqlx_error("write", e)
            }
        })?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(DepthChange {
            before,
            after: before + 1,
        })
    }

    pub async fn get_async(&self, tenant_id: TenantId, id: DeadLetterId) -> Result<DeadLetterEntry, DeadLetterError> {
        let row = sqlx::query("SELECT body FROM dead_letters WHERE id = $1 AND tenant_id = $2")
            .bind(id.as_uuid())
            .bind(tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        match row {
            Some(row) => decode(&row, "dead letter entry"),
            None => Err(DeadLetterError::NotFound(id)),
        }
    }

    pub async fn list_async(&self, tenant_id: TenantId) -> Result<Vec<DeadLetterListing>, DeadLetterError> {
        let rows = sqlx::query(
            r#"
            SELECT d.body,
                   (SELECT COUNT(*) FROM dead_letter_reprocesses r WHERE r.dead_letter_id = d.id) AS reprocess_count
            FROM dead_letters d
            WHERE d.tenant_id = $1
            ORDER BY d.seq
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter()
            .map(|row| {
                let count: i64 = row.try_get("reprocess_count").map_err(|e| map_sqlx_error("list", e))?;
                Ok(DeadLetterListing {
                    entry: decode(row, "dead letter entry")?,
                    reprocess_count: count.max(0) as u32,
                })
            })
            .collect()
    }

    pub async fn record_reprocess_async(
        &self,
        tenant_id: TenantId,
        record: ReprocessRecord,
    ) -> Result<(), DeadLetterError> {
        let mut tx = self.begin_for(tenant_id).await?;
        let found = sqlx::query("SELECT 1 FROM dead_letters WHERE id = $1 AND tenant_id = $2")
            .bind(record.dead_letter_id.as_uuid())
            .bind(tenant_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_reprocess", e))?;
        if found.is_none() {
            return Err(DeadLetterError::NotFound(record.dead_letter_id));
        }

        sqlx::query("INSERT INTO dead_letter_reprocesses (dead_letter_id, tenant_id, body) VALUES ($1, $2, $3)")
            .bind(record.dead_letter_id.as_uuid())
            .bind(tenant_id.as_uuid())
            .bind(encode("reprocess record", &record)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_reprocess", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    pub async fn reprocess_history_async(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
    ) -> Result<Vec<ReprocessRecord>, DeadLetterError> {
        self.get_async(tenant_id, id).await?;
        let rows = sqlx::query("SELECT body FROM dead_letter_reprocesses WHERE dead_letter_id = $1 ORDER BY seq")
            .bind(id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reprocess_history", e))?;
        rows.iter().map(|row| decode(row, "reprocess record")).collect()
    }

    pub async fn depth_async(&self, tenant_id: TenantId) -> Result<usize, DeadLetterError> {
        let depth: i64 = sqlx::query_scalar(DEPTH_QUERY)
            .bind(tenant_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("depth", e))?;
        Ok(depth.max(0) as usize)
    }

    pub async fn find_by_execution_async(
        &self,
        tenant_id: TenantId,
        execution_id: ExecutionId,
    ) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        let row = sqlx::query(
            r#"
            SELECT body FROM dead_letters
            WHERE tenant_id = $1 AND execution_id = $2
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(execution_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_execution", e))?;

        row.as_ref().map(|row| decode(row, "dead letter entry")).transpose()
    }

    /// Transaction holding the firm's DLQ lock until it ends.
    async fn begin_for(&self, tenant_id: TenantId) -> Result<Transaction<'static, Postgres>, DeadLetterError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(tenant_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_firm", e))?;
        Ok(tx)
    }
}

impl DeadLetterStore for PostgresDeadLetterStore {
    fn write(&self, entry: DeadLetterEntry) -> Result<DepthChange, DeadLetterError> {
        self.block_on(self.write_async(entry))
    }

    fn get(&self, tenant_id: TenantId, id: DeadLetterId) -> Result<DeadLetterEntry, DeadLetterError> {
        self.block_on(self.get_async(tenant_id, id))
    }

    fn list(&self, tenant_id: TenantId) -> Result<Vec<DeadLetterListing>, DeadLetterError> {
        self.block_on(self.list_async(tenant_id))
    }

    fn record_reprocess(&self, tenant_id: TenantId, record: ReprocessRecord) -> Result<(), DeadLetterError> {
        self.block_on(self.record_reprocess_async(tenant_id, record))
    }

    fn reprocess_history(
        &self,
        tenant_id: TenantId,
        id: DeadLetterId,
    ) -> Result<Vec<ReprocessRecord>, DeadLetterError> {
        self.block_on(self.reprocess_history_async(tenant_id, id))
    }

    fn depth(&self, tenant_id: TenantId) -> Result<usize, DeadLetterError> {
        self.block_on(self.depth_async(tenant_id))
    }

    fn find_by_execution(
        &self,
        tenant_id: TenantId,
        execution_id: ExecutionId,
    ) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        self.block_on(self.find_by_execution_async(tenant_id, execution_id))
    }
}

async fn depth_in(tx: &mut Transaction<'static, Postgres>, tenant_id: TenantId) -> Result<usize, DeadLetterError> {
    let depth: i64 = sqlx::query_scalar(DEPTH_QUERY)
        .bind(tenant_id.as_uuid())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("depth", e))?;
    Ok(depth.max(0) as usize)
}

fn encode<T: Serialize>(what: &str, value: &T) -> Result<serde_json::Value, DeadLetterError> {
    serde_json::to_value(value).map_err(|e| DeadLetterError::Storage(format!("failed to encode {what}: {e}")))
}

fn decode<T: DeserializeOwned>(row: &PgRow, what: &str) -> Result<T, DeadLetterError> {
    let body: serde_json::Value = row.try_get("body").map_err(|e| map_sqlx_error("decode", e))?;
    serde_json::from_value(body).map_err(|e| DeadLetterError::Storage(format!("failed to decode {what}: {e}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DeadLetterError {
    match err {
        sqlx::Error::Database(db_err) => DeadLetterError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => DeadLetterError::Storage(format!("connection pool closed in {}", operation)),
        _ => DeadLetterError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
