//! Job producer: enqueue with merged defaults plus administrative operations.

use std::sync::Arc;
use std::time::Duration;

use pq_common::{
    Backoff, Job, JobState, PriorityLevel, QueueCounts, QueueEventKind, QueueEventPayload, RetryPolicy,
};
use pq_queue::{NewJob, QueueBackend};
use tracing::{debug, info};

use crate::hooks::MetricsHookBus;
use crate::priority::PriorityMapper;
use crate::retry::{describe_backoff, RetryPolicyRegistry};
use crate::{telemetry, JobError, Result};

/// Caller overrides for a single job.
///
/// An explicit `priority` wins over `tier`; with neither the job is Normal.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub priority: Option<PriorityLevel>,
    /// Subscription tier, mapped through the producer's `PriorityMapper`
    pub tier: Option<String>,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub delay: Option<Duration>,
    pub dedupe_key: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: PriorityLevel) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// One entry of a bulk enqueue, carrying its own options.
#[derive(Debug, Clone)]
pub struct BulkJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
}

impl BulkJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value, options: JobOptions) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            options,
        }
    }
}

pub struct JobProducer {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<RetryPolicyRegistry>,
    priorities: Arc<PriorityMapper>,
    hooks: Arc<MetricsHookBus>,
}

impl JobProducer {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        registry: Arc<RetryPolicyRegistry>,
        priorities: Arc<PriorityMapper>,
        hooks: Arc<MetricsHookBus>,
    ) -> Self {
        Self {
            backend,
            registry,
            priorities,
            hooks,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.backend.name()
    }

    pub fn hooks(&self) -> &Arc<MetricsHookBus> {
        &self.hooks
    }

    fn resolve_priority(&self, options: &JobOptions) -> PriorityLevel {
        options
            .priority
            .or_else(|| options.tier.as_deref().map(|t| self.priorities.get_tier_priority(t)))
            .unwrap_or_default()
    }

    fn build(&self, job_type: &str, payload: serde_json::Value, options: JobOptions) -> Result<NewJob> {
        if job_type.trim().is_empty() {
            return Err(JobError::InvalidJob("job type must not be empty".to_string()));
        }

        let defaults = self.registry.get_retry_config(job_type);
        let policy = RetryPolicy::new(
            options.attempts.unwrap_or(defaults.attempts),
            options.backoff.unwrap_or(defaults.backoff),
        );
        let priority = self.resolve_priority(&options);

        Ok(NewJob {
            name: job_type.to_string(),
            payload,
            priority,
            policy,
            delay: options.delay,
            dedupe_key: options.dedupe_key,
        })
    }

    fn emit_added(&self, job: &Job) {
        telemetry::record_job_enqueued(&job.queue_name, &job.name, job.priority);
        self.hooks.emit(
            &QueueEventPayload::for_job(QueueEventKind::Added, job).with_data(serde_json::json!({
                "priority": job.priority.value(),
                "maxAttempts": job.max_attempts,
                "delayed": job.state == JobState::Delayed,
            })),
        );
    }

    /// Enqueue one job. A dedupe key that is already held returns the
    /// existing job and emits nothing.
    pub async fn add_job(&self, job_type: &str, payload: serde_json::Value, options: JobOptions) -> Result<Job> {
        if let Some(key) = options.dedupe_key.as_deref() {
            if let Some(existing) = self.backend.find_by_dedupe_key(key).await? {
                debug!(job_id = %existing.id, dedupe_key = key, "Job already queued");
                return Ok(existing);
            }
        }

        let new_job = self.build(job_type, payload, options)?;
        let job = self.backend.enqueue(new_job).await?;

        debug!(
            job_id = %job.id,
            job_type = %job.name,
            priority = %job.priority,
            attempts = job.max_attempts,
            backoff = describe_backoff(&job.backoff),
            "Job enqueued"
        );
        self.emit_added(&job);
        Ok(job)
    }

    /// Enqueue every job in one backend call; either all are created or
    /// none are.
    pub async fn add_bulk(&self, jobs: Vec<BulkJob>) -> Result<Vec<Job>> {
        let new_jobs = jobs
            .into_iter()
            .map(|j| self.build(&j.job_type, j.payload, j.options))
            .collect::<Result<Vec<_>>>()?;

        let created = self.backend.enqueue_bulk(new_jobs).await?;
        info!(queue = %self.queue_name(), count = created.len(), "Bulk jobs enqueued");
        for job in &created {
            self.emit_added(job);
        }
        Ok(created)
    }

    pub async fn pause(&self) -> Result<QueueCounts> {
        self.backend.pause().await?;
        info!(queue = %self.queue_name(), "Queue paused");
        self.get_metrics().await
    }

    pub async fn resume(&self) -> Result<QueueCounts> {
        self.backend.resume().await?;
        info!(queue = %self.queue_name(), "Queue resumed");
        self.get_metrics().await
    }

    /// Remove all waiting and delayed jobs.
    pub async fn drain(&self) -> Result<QueueCounts> {
        let removed = self.backend.drain().await?;
        info!(queue = %self.queue_name(), removed = removed.len(), "Queue drained");
        self.emit_removed(&removed);
        self.get_metrics().await
    }

    /// Remove completed jobs that finished more than `grace` ago.
    pub async fn clean_completed(&self, grace: Duration) -> Result<QueueCounts> {
        self.clean(JobState::Completed, grace).await
    }

    /// Remove failed jobs that finished more than `grace` ago.
    pub async fn clean_failed(&self, grace: Duration) -> Result<QueueCounts> {
        self.clean(JobState::Failed, grace).await
    }

    async fn clean(&self, state: JobState, grace: Duration) -> Result<QueueCounts> {
        let removed = self.backend.clean(state, grace).await?;
        if !removed.is_empty() {
            info!(queue = %self.queue_name(), ?state, removed = removed.len(), "Queue cleaned");
        }
        self.emit_removed(&removed);
        self.get_metrics().await
    }

    fn emit_removed(&self, job_ids: &[String]) {
        for id in job_ids {
            self.hooks
                .emit(&QueueEventPayload::new(QueueEventKind::Removed, id.clone(), self.queue_name()));
        }
    }

    /// Point-in-time queue counts.
    pub async fn get_metrics(&self) -> Result<QueueCounts> {
        let counts = self.backend.counts().await?;
        telemetry::set_queue_depth(self.queue_name(), &counts);
        Ok(counts)
    }
}
