//! Engine wiring: stores, orchestrator, worker pool and listeners.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{info, warn};

use forgeflow_infra::{
    DeadLetterError, DeadLetterStore, EngineConfig, ExecutionStore, ExecutionStoreError,
    InMemoryDeadLetterStore, InMemoryDefinitionSource, InMemoryExecutionStore, InMemoryJobStore,
    JobStore, JobStoreError, Orchestrator, PostgresDeadLetterStore, PostgresExecutionStore,
    PostgresJobStore, WorkerPool, WorkerPoolHandle, WorkerStats,
};
use forgeflow_observability::{LifecycleMetrics, MetricsSnapshot, TracingLifecycleListener};
use forgeflow_workflow::{DefinitionError, HandlerRegistry, StepOutcome, handler_fn};

use super::errors::ApiError;

/// Upper bound on `forgeflow.delay` sleeps.
const MAX_DELAY_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("loading definitions: {0}")]
    Definitions(#[from] DefinitionError),

    #[error("connecting to postgres: {0}")]
    Database(#[from] sqlx::Error),

    #[error("preparing job store: {0}")]
    Jobs(#[from] JobStoreError),

    #[error("preparing execution store: {0}")]
    Executions(#[from] ExecutionStoreError),

    #[error("preparing dead letter store: {0}")]
    DeadLetters(#[from] DeadLetterError),

    #[error("starting worker pool: {0}")]
    Io(#[from] io::Error),
}

/// The three stores the engine persists to.
#[derive(Clone)]
pub struct EngineStores {
    pub jobs: Arc<dyn JobStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
}

impl EngineStores {
    pub fn in_memory() -> Self {
        Self {
            jobs: InMemoryJobStore::arc(),
            executions: InMemoryExecutionStore::arc(),
            dead_letters: InMemoryDeadLetterStore::arc(),
        }
    }

    /// All three stores on one Postgres database, schemas applied.
    pub async fn postgres(url: &str) -> Result<Self, StartupError> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        let runtime = Handle::current();

        let jobs = PostgresJobStore::new(pool.clone(), runtime.clone());
        jobs.migrate().await?;
        let executions = PostgresExecutionStore::new(pool.clone(), runtime.clone());
        executions.migrate().await?;
        let dead_letters = PostgresDeadLetterStore::new(pool, runtime);
        dead_letters.migrate().await?;

        Ok(Self {
            jobs: Arc::new(jobs),
            executions: Arc::new(executions),
            dead_letters: Arc::new(dead_letters),
        })
    }
}

/// Shared state behind every route.
pub struct AppServices {
    pub orchestrator: Arc<Orchestrator>,
    pub definitions: Arc<InMemoryDefinitionSource>,
    pub metrics: Arc<LifecycleMetrics>,
    pool: Mutex<Option<WorkerPoolHandle>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub definitions: usize,
    pub workers: Option<WorkerStats>,
    pub lifecycle: MetricsSnapshot,
}

impl AppServices {
    /// Build the orchestrator over `stores` and start the worker pool.
    pub fn new(
        stores: EngineStores,
        definitions: Arc<InMemoryDefinitionSource>,
        handlers: HandlerRegistry,
        config: &EngineConfig,
    ) -> io::Result<Self> {
        let metrics = Arc::new(LifecycleMetrics::default());
        let jobs = stores.jobs;
        let orchestrator = Arc::new(
            Orchestrator::builder(
                jobs.clone(),
                stores.executions,
                stores.dead_letters,
                definitions.clone(),
                handlers,
            )
            .config(config)
            .listener(TracingLifecycleListener::new())
            .listener(metrics.clone())
            .build(),
        );

        let pool = WorkerPool::spawn(jobs, orchestrator.clone(), config.worker_pool())?;

        Ok(Self {
            orchestrator,
            definitions,
            metrics,
            pool: Mutex::new(Some(pool)),
        })
    }

    /// Production wiring: definitions from `FORGEFLOW_DEFINITIONS`, Postgres
    /// stores when `DATABASE_URL` is set, in-memory stores otherwise.
    pub async fn from_config(config: &EngineConfig, handlers: HandlerRegistry) -> Result<Self, StartupError> {
        let definitions = match &config.definitions_path {
            Some(path) => Arc::new(InMemoryDefinitionSource::load_file(path)?),
            None => {
                warn!("FORGEFLOW_DEFINITIONS not set; starting with no workflow definitions");
                InMemoryDefinitionSource::arc()
            }
        };

        let stores = match &config.database_url {
            Some(url) => {
                let stores = EngineStores::postgres(url).await?;
                info!("using postgres job, execution and dead letter stores");
                stores
            }
            None => {
                warn!("DATABASE_URL not set; jobs, executions and dead letters are kept in memory");
                EngineStores::in_memory()
            }
        };

        Ok(Self::new(stores, definitions, handlers, config)?)
    }

    /// Run engine work off the async executor; stores may block.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&AppServices) -> Result<T, ApiError> + Send + 'static,
        T: Send + 'static,
    {
        let services = self.clone();
        tokio::task::spawn_blocking(move || f(&services)).await?
    }

    pub fn health(&self) -> Health {
        let workers = self
            .pool
            .lock()
            .ok()
            .and_then(|pool| pool.as_ref().map(WorkerPoolHandle::stats));
        Health {
            status: "ok",
            definitions: self.definitions.len(),
            workers,
            lifecycle: self.metrics.snapshot(),
        }
    }

    /// Stop the worker pool, letting in-flight jobs finish. Idempotent.
    pub fn shutdown(&self) {
        let pool = self.pool.lock().ok().and_then(|mut pool| pool.take());
        if let Some(pool) = pool {
            pool.shutdown();
            info!("worker pool stopped");
        }
    }
}

impl Drop for AppServices {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn context_u64(context: &forgeflow_core::WorkflowContext, field: &str) -> Option<u64> {
    context.get(field).and_then(|v| v.as_u64())
}

/// Handlers shipped with the server, usable from any definition.
///
/// - `forgeflow.noop`: succeeds with no output
/// - `forgeflow.fail`: fails permanently
/// - `forgeflow.flaky`: fails transiently while `attempt <= fail_attempts`
///   (context field, default 1)
/// - `forgeflow.delay`: sleeps `delay_ms` (context field) then succeeds
pub fn builtin_handlers() -> HandlerRegistry {
    HandlerRegistry::builder()
        .register("forgeflow.noop", handler_fn(|_, _| StepOutcome::success()))
        .register(
            "forgeflow.fail",
            handler_fn(|inv, _| StepOutcome::permanent("step_failed", format!("{} always fails", inv.step_id))),
        )
        .register(
            "forgeflow.flaky",
            handler_fn(|inv, _| {
                let fail_attempts = context_u64(inv.context, "fail_attempts").unwrap_or(1);
                if u64::from(inv.attempt) <= fail_attempts {
                    StepOutcome::transient("flaky", format!("attempt {} failed", inv.attempt))
                } else {
                    StepOutcome::success()
                }
            }),
        )
        .register(
            "forgeflow.delay",
            handler_fn(|inv, _| {
                let ms = context_u64(inv.context, "delay_ms").unwrap_or(0).min(MAX_DELAY_MS);
                std::thread::sleep(Duration::from_millis(ms));
                StepOutcome::success()
            }),
        )
        .build()
}
