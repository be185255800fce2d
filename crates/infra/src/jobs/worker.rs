//! Worker pool: poll, claim, execute, report.
//!
//! Each worker thread runs an independent loop against the job store; the
//! store's atomic claim is the only coordination between them. While a job
//! runs, a scoped heartbeat thread keeps its lease alive. A worker that stops
//! heartbeating (crash, stall) simply lets the lease expire and another
//! worker picks the job up.

use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use forgeflow_core::WorkerId;

use super::store::{JobStore, JobStoreError};
use super::types::ClaimedJob;
use crate::error::EngineError;

/// What the worker should do with a job once processing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The step succeeded.
    Completed,
    /// The step failed; a retry or compensation was scheduled.
    Failed,
    /// The execution was frozen in the DLQ.
    DeadLettered,
    /// Nothing to do (stale job, cancelled execution).
    Skipped,
    /// Keep the job and redeliver it after the delay.
    Release(Duration),
}

impl Disposition {
    pub fn acks(self) -> bool {
        !matches!(self, Disposition::Release(_))
    }
}

/// Executes claimed jobs.
pub trait JobProcessor: Send + Sync {
    /// Process one claimed job.
    ///
    /// An `Err` leaves the job claimed; it becomes visible again once its
    /// lease expires.
    fn process(&self, job: &ClaimedJob) -> Result<Disposition, EngineError>;
}

impl<P> JobProcessor for Arc<P>
where
    P: JobProcessor + ?Sized,
{
    fn process(&self, job: &ClaimedJob) -> Result<Disposition, EngineError> {
        (**self).process(job)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Name prefix for threads and logs
    pub name: String,
    pub queue: String,
    pub workers: usize,
    /// Jobs claimed per poll
    pub batch_size: usize,
    /// Sleep after the first empty poll
    pub poll_interval: Duration,
    /// Cap for the doubling empty-poll backoff
    pub max_idle_backoff: Duration,
    pub lease: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "forgeflow-worker".to_string(),
            queue: "workflow-steps".to_string(),
            workers: 4,
            batch_size: 1,
            poll_interval: Duration::from_millis(100),
            max_idle_backoff: Duration::from_secs(2),
            lease: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_idle_backoff(mut self, max_idle_backoff: Duration) -> Self {
        self.max_idle_backoff = max_idle_backoff;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_claimed: u64,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_skipped: u64,
    pub jobs_released: u64,
    /// Processor returned an error; job left for lease expiry.
    pub processing_errors: u64,
    /// Ack/nack/heartbeat found the claim already gone.
    pub leases_lost: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

type SharedStats = Arc<Mutex<WorkerStats>>;

fn with_stats(stats: &SharedStats, f: impl FnOnce(&mut WorkerStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: SharedStats,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for every worker.
    ///
    /// In-flight jobs finish first; nothing is interrupted.
    pub fn shutdown(self) {
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        for join in self.joins {
            let _ = join.join();
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn workers(&self) -> usize {
        self.joins.len()
    }
}

/// Fixed-size pool of polling worker threads.
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.workers` threads processing `config.queue`.
    pub fn spawn<S, P>(store: S, processor: P, config: WorkerPoolConfig) -> io::Result<WorkerPoolHandle>
    where
        S: JobStore + Clone + 'static,
        P: JobProcessor + Clone + 'static,
    {
        let stats: SharedStats = Arc::new(Mutex::new(WorkerStats::default()));
        let mut shutdown = Vec::with_capacity(config.workers);
        let mut joins = Vec::with_capacity(config.workers);

        for n in 0..config.workers.max(1) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let worker = Worker {
                id: WorkerId::new(format!("{}-{}", config.name, n)),
                store: store.clone(),
                processor: processor.clone(),
                config: config.clone(),
                stats: stats.clone(),
            };

            let join = thread::Builder::new()
                .name(worker.id.to_string())
                .spawn(move || worker.run(shutdown_rx))?;

            shutdown.push(shutdown_tx);
            joins.push(join);
        }

        info!(pool = %config.name, queue = %config.queue, workers = joins.len(), "worker pool started");

        Ok(WorkerPoolHandle {
            shutdown,
            joins,
            stats,
            started: Instant::now(),
        })
    }
}

struct Worker<S, P> {
    id: WorkerId,
    store: S,
    processor: P,
    config: WorkerPoolConfig,
    stats: SharedStats,
}

impl<S, P> Worker<S, P>
where
    S: JobStore,
    P: JobProcessor,
{
    fn run(self, shutdown_rx: mpsc::Receiver<()>) {
        debug!(worker = %self.id, "worker started");
        let mut idle = IdleBackoff::new(self.config.poll_interval, self.config.max_idle_backoff);

        loop {
            if shutdown_requested(&shutdown_rx) {
                break;
            }

            let batch = match self.store.claim(
                &self.id,
                &self.config.queue,
                self.config.batch_size,
                self.config.lease,
            ) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(worker = %self.id, error = %e, "failed to claim jobs");
                    if wait_or_shutdown(&shutdown_rx, self.config.poll_interval) {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if wait_or_shutdown(&shutdown_rx, idle.next_delay()) {
                    break;
                }
                continue;
            }

            idle.reset();
            with_stats(&self.stats, |s| s.jobs_claimed += batch.len() as u64);

            for claimed in &batch {
                self.execute(claimed);
            }
        }

        debug!(worker = %self.id, "worker stopped");
    }

    fn execute(&self, claimed: &ClaimedJob) {
        let job = &claimed.job;
        debug!(
            worker = %self.id,
            job_id = %job.id,
            execution_id = %job.payload.execution_id,
            step_id = %job.payload.step_id,
            attempt = job.payload.attempt,
            delivery = job.attempt_count,
            "claimed job"
        );

        with_stats(&self.stats, |s| s.current_running += 1);
        let result = self.with_heartbeat(claimed, || self.processor.process(claimed));
        with_stats(&self.stats, |s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
        });

        let disposition = match result {
            Ok(d) => d,
            Err(e) => {
                error!(
                    worker = %self.id,
                    job_id = %job.id,
                    correlation_id = %job.correlation_id,
                    error = %e,
                    "job processing failed; leaving it for lease expiry"
                );
                with_stats(&self.stats, |s| s.processing_errors += 1);
                return;
            }
        };

        with_stats(&self.stats, |s| match disposition {
            Disposition::Completed => s.jobs_succeeded += 1,
            Disposition::Failed => s.jobs_failed += 1,
            Disposition::DeadLettered => {
                s.jobs_failed += 1;
                s.jobs_dead_lettered += 1;
            }
            Disposition::Skipped => s.jobs_skipped += 1,
            Disposition::Release(_) => s.jobs_released += 1,
        });

        let reported = match disposition {
            Disposition::Release(delay) => self.store.nack(job.id, claimed.token, delay),
            _ => self.store.ack(job.id, claimed.token),
        };

        match reported {
            Ok(()) => {}
            Err(JobStoreError::ClaimLost(_)) => {
                warn!(worker = %self.id, job_id = %job.id, "claim lost before the job was reported");
                with_stats(&self.stats, |s| s.leases_lost += 1);
            }
            Err(e) => {
                error!(worker = %self.id, job_id = %job.id, error = %e, "failed to report job");
            }
        }
    }

    /// Run `f` while a scoped thread extends the lease every heartbeat interval.
    fn with_heartbeat<T>(&self, claimed: &ClaimedJob, f: impl FnOnce() -> T) -> T {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        thread::scope(|scope| {
            scope.spawn(move || {
                loop {
                    match done_rx.recv_timeout(self.config.heartbeat_interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    match self.store.extend_lease(claimed.id(), claimed.token, self.config.lease) {
                        Ok(expires) => {
                            debug!(worker = %self.id, job_id = %claimed.id(), %expires, "lease extended")
                        }
                        Err(e) => {
                            warn!(worker = %self.id, job_id = %claimed.id(), error = %e, "heartbeat failed");
                            if matches!(e, JobStoreError::ClaimLost(_)) {
                                with_stats(&self.stats, |s| s.leases_lost += 1);
                                break;
                            }
                        }
                    }
                }
            });

            let out = f();
            drop(done_tx);
            out
        })
    }
}

fn shutdown_requested(rx: &mpsc::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(mpsc::TryRecvError::Empty))
}

/// Sleep for `delay` unless shutdown arrives first. Returns `true` on shutdown.
fn wait_or_shutdown(rx: &mpsc::Receiver<()>, delay: Duration) -> bool {
    !matches!(rx.recv_timeout(delay), Err(mpsc::RecvTimeoutError::Timeout))
}

/// Doubling sleep between empty polls.
#[derive(Debug, Clone)]
struct IdleBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{Job, StepJob};
    use forgeflow_core::{CorrelationId, ExecutionId, TenantId};
    use forgeflow_workflow::StepId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn enqueue(store: &InMemoryJobStore, n: usize) {
        let tenant = TenantId::new();
        for _ in 0..n {
            let job = Job::new(
                Some(tenant),
                "workflow-steps",
                StepJob::forward(ExecutionId::new(), StepId::new("a"), 1),
                CorrelationId::generate(),
            )
            .unwrap();
            store.enqueue(job).unwrap();
        }
    }

    #[derive(Clone, Default)]
    struct Counting {
        seen: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl JobProcessor for Counting {
        fn process(&self, _job: &ClaimedJob) -> Result<Disposition, EngineError> {
            thread::sleep(self.delay);
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(Disposition::Completed)
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn fast_config() -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_workers(3)
            .with_poll_interval(Duration::from_millis(5))
            .with_max_idle_backoff(Duration::from_millis(20))
    }

    #[test]
    fn pool_drains_queue_and_acks() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, 10);
        let processor = Counting::default();

        let handle = WorkerPool::spawn(store.clone(), processor.clone(), fast_config()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            processor.seen.load(Ordering::SeqCst) == 10 && store.depth("workflow-steps").unwrap() == 0
        }));

        let stats = handle.stats();
        assert_eq!(stats.jobs_succeeded, 10);
        assert_eq!(stats.jobs_processed, 10);
        handle.shutdown();
    }

    #[test]
    fn heartbeat_keeps_long_jobs_leased() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, 1);
        let processor = Counting {
            delay: Duration::from_millis(150),
            ..Default::default()
        };
        let config = fast_config()
            .with_workers(2)
            .with_lease(Duration::from_millis(50))
            .with_heartbeat_interval(Duration::from_millis(15));

        let handle = WorkerPool::spawn(store.clone(), processor.clone(), config).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            store.depth("workflow-steps").unwrap() == 0
        }));
        thread::sleep(Duration::from_millis(50));

        // The lease never lapsed, so the second worker never got the job.
        assert_eq!(processor.seen.load(Ordering::SeqCst), 1);
        assert_eq!(handle.stats().leases_lost, 0);
        handle.shutdown();
    }

    #[test]
    fn idle_backoff_doubles_and_resets() {
        let mut idle = IdleBackoff::new(Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(idle.next_delay(), Duration::from_millis(10));
        assert_eq!(idle.next_delay(), Duration::from_millis(20));
        assert_eq!(idle.next_delay(), Duration::from_millis(35));
        assert_eq!(idle.next_delay(), Duration::from_millis(35));
        idle.reset();
        assert_eq!(idle.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn release_nacks_the_job() {
        #[derive(Clone)]
        struct Releasing;
        impl JobProcessor for Releasing {
            fn process(&self, _job: &ClaimedJob) -> Result<Disposition, EngineError> {
                Ok(Disposition::Release(Duration::from_secs(60)))
            }
        }

        let store = InMemoryJobStore::arc();
        enqueue(&store, 1);
        let handle = WorkerPool::spawn(store.clone(), Releasing, fast_config().with_workers(1)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || handle.stats().jobs_released == 1));
        let job = store.all().unwrap().remove(0);
        assert!(job.claim_token.is_none());
        assert!(job.available_at > chrono::Utc::now());
        handle.shutdown();
    }
}
