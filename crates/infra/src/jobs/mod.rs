//! Job store and worker pool.
//!
//! ## Design
//!
//! - Every job is one attempt of one step (`StepJob`) for one firm
//! - `claim` is an atomic conditional update and the only point of
//!   coordination between workers
//! - Leases expire; an expired claim is reclaimable by any worker
//!   (at-least-once delivery)
//! - `ack`/`nack`/`extend_lease` present the claim token (claim-then-verify)
//!
//! ## Components
//!
//! - `Job`, `StepJob`, `ClaimedJob`: job model
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `WorkerPool`: poll-claim-execute threads with lease heartbeat

pub mod postgres;
pub mod store;
pub mod types;
pub mod worker;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{ClaimToken, ClaimedJob, Job, StepJob};
pub use worker::{
    Disposition, JobProcessor, WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats,
};
