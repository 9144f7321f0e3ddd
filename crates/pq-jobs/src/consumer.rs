//! JobConsumer - bounded-concurrency handler execution
//!
//! - Semaphore-based concurrency control
//! - Per-job-type rate limiting using governor
//! - Lock heartbeat capped by the job-type timeout
//! - Periodic stalled-job recovery
//! - Lifecycle events through the `MetricsHookBus`

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use governor::{clock::DefaultClock, state::{InMemoryState, NotKeyed}, Quota, RateLimiter};
use pq_common::{Job, JobProgress, JobRateLimit, QueueEventKind, QueueEventPayload};
use pq_config::QueueConfig;
use pq_queue::{FailOutcome, LockedJob, QueueBackend, QueueError, StalledJob};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::hooks::MetricsHookBus;
use crate::retry::RetryPolicyRegistry;
use crate::{telemetry, JobError, Result, UnrecoverableError};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const CONCURRENCY_ENV: &str = "PIXELQ_WORKER_CONCURRENCY";

/// Reason recorded on jobs failed by stall recovery
pub const STALLED_LIMIT_REASON: &str = "job stalled more than allowable limit";

/// Work executed for each reserved job.
///
/// Returning an error fails the attempt; the backend decides whether the
/// job is delivered again. An error whose chain contains
/// [`UnrecoverableError`] fails the job without further attempts.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> anyhow::Result<serde_json::Value>;
}

/// Per-invocation context handed to a handler.
pub struct JobContext {
    job_id: String,
    queue_name: String,
    job_name: String,
    backend: Arc<dyn QueueBackend>,
    hooks: Arc<MetricsHookBus>,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Persist progress and emit a Progress event.
    pub async fn update_progress(&self, progress: JobProgress) -> Result<Job> {
        report_progress(&self.backend, &self.hooks, &self.job_id, progress).await
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }
}

async fn report_progress(
    backend: &Arc<dyn QueueBackend>,
    hooks: &MetricsHookBus,
    job_id: &str,
    progress: JobProgress,
) -> Result<Job> {
    let data = progress.to_value();
    let job = backend.update_progress(job_id, progress).await?;
    hooks.emit(&QueueEventPayload::for_job(QueueEventKind::Progress, &job).with_data(data));
    Ok(job)
}

/// Worker settings
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    /// How often expired locks are looked for
    pub stalled_interval: Duration,
    pub max_stalled_count: u32,
    pub lock_duration: Duration,
    pub lock_renew_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(100),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
            lock_duration: Duration::from_secs(30),
            lock_renew_interval: Duration::from_secs(15),
        }
    }
}

impl ConsumerConfig {
    /// Apply `PIXELQ_WORKER_CONCURRENCY` when set to a positive number.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(concurrency) = std::env::var(CONCURRENCY_ENV)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|c| *c > 0)
        {
            self.concurrency = concurrency;
        }
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

impl From<&QueueConfig> for ConsumerConfig {
    fn from(cfg: &QueueConfig) -> Self {
        Self {
            concurrency: cfg.concurrency,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            stalled_interval: Duration::from_millis(cfg.stalled_interval_ms),
            max_stalled_count: cfg.max_stalled_count,
            lock_duration: Duration::from_millis(cfg.lock_duration_ms),
            lock_renew_interval: Duration::from_millis(cfg.lock_renew_interval_ms),
        }
    }
}

/// Aborts the lock heartbeat when the invocation ends, including on panic.
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Executes one handler per reserved job with bounded concurrency.
pub struct JobConsumer {
    backend: Arc<dyn QueueBackend>,
    handler: Arc<dyn JobHandler>,
    hooks: Arc<MetricsHookBus>,
    registry: Arc<RetryPolicyRegistry>,
    config: ConsumerConfig,

    semaphore: Arc<Semaphore>,

    /// Lazily created token buckets keyed by job type
    limiters: DashMap<String, Option<Arc<DirectLimiter>>>,

    running: AtomicBool,
    shutdown: Notify,
    active_jobs: AtomicU32,
}

impl JobConsumer {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        handler: Arc<dyn JobHandler>,
        hooks: Arc<MetricsHookBus>,
        registry: Arc<RetryPolicyRegistry>,
        mut config: ConsumerConfig,
    ) -> Self {
        config.concurrency = config.concurrency.max(1);
        config.lock_renew_interval = config.lock_renew_interval.max(Duration::from_millis(1));
        config.poll_interval = config.poll_interval.max(Duration::from_millis(1));
        config.stalled_interval = config.stalled_interval.max(Duration::from_millis(1));

        Self {
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            backend,
            handler,
            hooks,
            registry,
            config,
            limiters: DashMap::new(),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            active_jobs: AtomicU32::new(0),
        }
    }

    pub fn queue_name(&self) -> &str {
        self.backend.name()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn hooks(&self) -> &Arc<MetricsHookBus> {
        &self.hooks
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_jobs(&self) -> u32 {
        self.active_jobs.load(Ordering::SeqCst)
    }

    /// Poll the backend and execute jobs until `shutdown` is called.
    pub async fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            queue = %self.queue_name(),
            concurrency = self.config.concurrency,
            "Job consumer started"
        );

        let stall_checker = {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.run_stall_checker().await })
        };

        while self.is_running() {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    error!("Semaphore closed");
                    break;
                }
            };
            if !self.is_running() {
                break;
            }

            match self.backend.reserve(self.config.lock_duration).await {
                Ok(Some(locked)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        // Failures are logged and emitted inside process_job
                        let _ = this.process_job(locked).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.idle().await;
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = %self.queue_name(), error = %e, "Failed to reserve job");
                    telemetry::record_backend_error(self.queue_name(), "reserve");
                    self.idle().await;
                }
            }
        }

        stall_checker.abort();
        info!(queue = %self.queue_name(), "Job consumer stopped polling");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = self.shutdown.notified() => {}
        }
    }

    /// Stop polling and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        info!(queue = %self.queue_name(), "Shutting down job consumer");
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        match self.semaphore.acquire_many(self.config.concurrency as u32).await {
            Ok(permits) => drop(permits),
            Err(_) => warn!("Semaphore closed during shutdown"),
        }
        info!(queue = %self.queue_name(), "Job consumer drained");
    }

    async fn run_stall_checker(&self) {
        let mut ticker = tokio::time::interval(self.config.stalled_interval);
        ticker.tick().await;
        while self.is_running() {
            ticker.tick().await;
            if let Err(e) = self.check_stalled().await {
                error!(queue = %self.queue_name(), error = %e, "Stalled job check failed");
                telemetry::record_backend_error(self.queue_name(), "recover_stalled");
            }
        }
    }

    /// Recover jobs whose lock expired. Each gets a Stalled event; jobs past
    /// `max_stalled_count` are failed and also get a Failed event.
    pub async fn check_stalled(&self) -> Result<Vec<StalledJob>> {
        let stalled = self.backend.recover_stalled(self.config.max_stalled_count).await?;

        for entry in &stalled {
            let job = &entry.job;
            warn!(
                job_id = %job.id,
                job_name = %job.name,
                stalled_count = job.stalled_count,
                failed = entry.failed,
                "Job lock expired, job stalled"
            );
            telemetry::record_job_stalled(&job.queue_name);
            self.hooks.emit(
                &QueueEventPayload::for_job(QueueEventKind::Stalled, job).with_data(serde_json::json!({
                    "stalledCount": job.stalled_count,
                    "failed": entry.failed,
                })),
            );
            if entry.failed {
                telemetry::record_job_processed(&job.queue_name, &job.name, "failed");
                self.hooks.emit(
                    &QueueEventPayload::for_job(QueueEventKind::Failed, job).with_error(STALLED_LIMIT_REASON),
                );
            }
        }
        Ok(stalled)
    }

    /// Persist progress for a job and emit a Progress event.
    pub async fn update_progress(&self, job_id: &str, progress: JobProgress) -> Result<Job> {
        report_progress(&self.backend, &self.hooks, job_id, progress).await
    }

    fn limiter_for(&self, job_type: &str) -> Option<Arc<DirectLimiter>> {
        if let Some(entry) = self.limiters.get(job_type) {
            return entry.value().clone();
        }
        let limiter = self.registry.get_rate_limit(job_type).and_then(build_limiter);
        self.limiters.insert(job_type.to_string(), limiter.clone());
        limiter
    }

    /// Wait until the job type's token bucket has a permit.
    async fn wait_for_rate_limit_permit(&self, job_type: &str) {
        let Some(limiter) = self.limiter_for(job_type) else {
            return;
        };

        let mut recorded = false;
        while limiter.check().is_err() {
            if !recorded {
                telemetry::record_job_rate_limited(job_type);
                debug!(job_type, "Rate limited - waiting for permit");
                recorded = true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Run the handler for one reserved job and report the outcome.
    ///
    /// Emits Active, then Completed or Failed. A handler error is returned
    /// after the backend has been told about the failed attempt.
    pub async fn process_job(&self, locked: LockedJob) -> Result<serde_json::Value> {
        let span = info_span!("job", job_id = %locked.job.id, job_name = %locked.job.name);
        self.execute(locked).instrument(span).await
    }

    async fn execute(&self, locked: LockedJob) -> Result<serde_json::Value> {
        let LockedJob { job, token, .. } = locked;
        let timeout = self.registry.get_timeout(&job.name);
        let handler_started: Arc<OnceLock<Instant>> = Arc::new(OnceLock::new());

        let _heartbeat = HeartbeatGuard(tokio::spawn(heartbeat(
            Arc::clone(&self.backend),
            job.id.clone(),
            token.clone(),
            self.config.lock_duration,
            self.config.lock_renew_interval,
            timeout,
            Arc::clone(&handler_started),
        )));

        self.wait_for_rate_limit_permit(&job.name).await;

        let started = Instant::now();
        let _ = handler_started.set(started);
        if let Err(e) = self
            .backend
            .renew_lock(&job.id, &token, self.config.lock_duration.min(timeout))
            .await
        {
            warn!(error = %e, "Could not renew lock before running handler");
        }

        let active = self.active_jobs.fetch_add(1, Ordering::SeqCst) + 1;
        telemetry::set_active_jobs(&job.queue_name, active);
        self.hooks.emit(&QueueEventPayload::for_job(QueueEventKind::Active, &job).with_data(
            serde_json::json!({ "attemptsMade": job.attempts_made }),
        ));

        let ctx = JobContext {
            job_id: job.id.clone(),
            queue_name: job.queue_name.clone(),
            job_name: job.name.clone(),
            backend: Arc::clone(&self.backend),
            hooks: Arc::clone(&self.hooks),
        };
        let outcome = self.handler.handle(&job, &ctx).await;

        let active = self.active_jobs.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        telemetry::set_active_jobs(&job.queue_name, active);
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                match self.backend.complete(&job.id, &token, value.clone()).await {
                    Ok(done) => {
                        debug!(duration_ms, "Job completed");
                        telemetry::record_job_processed(&job.queue_name, &job.name, "completed");
                        self.hooks.emit(
                            &QueueEventPayload::for_job(QueueEventKind::Completed, &done).with_data(value.clone()),
                        );
                    }
                    Err(QueueError::LockMismatch(_)) => {
                        warn!(duration_ms, "Lock lost before completion, job will be delivered again");
                        telemetry::record_job_processed(&job.queue_name, &job.name, "lock_lost");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to mark job completed");
                        telemetry::record_backend_error(&job.queue_name, "complete");
                        return Err(e.into());
                    }
                }
                Ok(value)
            }
            Err(err) => {
                let message = format!("{:#}", err);
                let mut data = serde_json::json!({ "attemptsMade": job.attempts_made + 1 });

                let recorded = if is_unrecoverable(&err) {
                    self.backend
                        .discard(&job.id, &token, &message)
                        .await
                        .map(|job| FailOutcome { job, retry_at: None })
                } else {
                    self.backend.fail(&job.id, &token, &message).await
                };
                match recorded {
                    Ok(result) => {
                        data = serde_json::json!({
                            "attemptsMade": result.job.attempts_made,
                            "willRetry": result.will_retry(),
                        });
                        if result.will_retry() {
                            warn!(duration_ms, error = %message, attempts_made = result.job.attempts_made, "Job attempt failed, retry scheduled");
                        } else {
                            error!(duration_ms, error = %message, attempts_made = result.job.attempts_made, "Job failed permanently");
                        }
                    }
                    Err(QueueError::LockMismatch(_)) => {
                        warn!(error = %message, "Job failed after its lock was lost");
                    }
                    Err(e) => {
                        error!(error = %e, handler_error = %message, "Failed to record job failure");
                        telemetry::record_backend_error(&job.queue_name, "fail");
                    }
                }

                telemetry::record_job_processed(&job.queue_name, &job.name, "failed");
                self.hooks.emit(
                    &QueueEventPayload::for_job(QueueEventKind::Failed, &job)
                        .with_error(message)
                        .with_data(data),
                );

                Err(JobError::Handler {
                    job_id: job.id.clone(),
                    source: err,
                })
            }
        }
    }
}

fn is_unrecoverable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<UnrecoverableError>())
}

fn build_limiter(limit: JobRateLimit) -> Option<Arc<DirectLimiter>> {
    let burst = NonZeroU32::new(limit.max)?;
    let period = Duration::from_millis(limit.window_ms) / limit.max;
    let quota = Quota::with_period(period)?.allow_burst(burst);
    Some(Arc::new(RateLimiter::direct(quota)))
}

/// Renew the job lock until aborted. Once the handler has started, the lock
/// is never extended past `started + timeout`, so a hung handler stalls.
async fn heartbeat(
    backend: Arc<dyn QueueBackend>,
    job_id: String,
    token: String,
    lock_duration: Duration,
    renew_interval: Duration,
    timeout: Duration,
    handler_started: Arc<OnceLock<Instant>>,
) {
    let mut ticker = tokio::time::interval(renew_interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let extend = match handler_started.get() {
            Some(started) => {
                let remaining = timeout.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    warn!(job_id = %job_id, timeout_ms = timeout.as_millis() as u64, "Job exceeded its timeout, lock no longer renewed");
                    return;
                }
                lock_duration.min(remaining)
            }
            None => lock_duration,
        };

        if let Err(e) = backend.renew_lock(&job_id, &token, extend).await {
            debug!(job_id = %job_id, error = %e, "Lock renewal failed, stopping heartbeat");
            return;
        }
    }
}
