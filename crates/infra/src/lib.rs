//! Infrastructure layer: job store, workers, persistence and the orchestrator.
//!
//! - [`jobs`]: claimable step jobs (in-memory and Postgres) and the worker pool
//! - [`executions`]: versioned execution store with append-only step records
//!   (in-memory and Postgres)
//! - [`dlq`]: dead letter queue with an append-only reprocess log (in-memory
//!   and Postgres)
//! - [`retry`]: backoff + jitter scheduling of new attempts
//! - [`idempotency`]: processed-key store for handler-side deduplication
//! - [`orchestrator`]: execution state machine, compensation engine, admin
//!   operations

pub mod config;
pub mod definitions;
pub mod dlq;
pub mod error;
pub mod executions;
pub mod idempotency;
pub mod jobs;
pub mod orchestrator;
pub mod retry;

#[cfg(test)]
mod integration_tests;

pub use config::EngineConfig;
pub use definitions::InMemoryDefinitionSource;
pub use dlq::{
    DeadLetterEntry, DeadLetterError, DeadLetterListing, DeadLetterStore, DepthChange,
    InMemoryDeadLetterStore, PostgresDeadLetterStore, ReprocessRecord,
};
pub use error::EngineError;
pub use executions::{
    ExecutionStore, ExecutionStoreError, InMemoryExecutionStore, PostgresExecutionStore,
};
pub use idempotency::{
    DedupingHandler, InMemoryProcessedKeyStore, KeyClaim, ProcessedKeyError, ProcessedKeyStore,
};
pub use jobs::{
    ClaimToken, ClaimedJob, Disposition, InMemoryJobStore, Job, JobProcessor, JobStore,
    JobStoreError, PostgresJobStore, StepJob, WorkerPool, WorkerPoolConfig, WorkerPoolHandle,
    WorkerStats,
};
pub use orchestrator::{
    ExecutionReport, Orchestrator, OrchestratorBuilder, OrchestratorSettings, StartExecution,
    StepExecutor, StepRequest,
};
pub use retry::{JitterSource, NoJitter, RandomJitter, RetryScheduler};
