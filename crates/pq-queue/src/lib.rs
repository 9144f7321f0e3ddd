//! PixelQ queue backends
//!
//! - `QueueBackend`: the capability set the producer and consumer rely on
//! - `MemoryQueue`: embedded priority queue with locks, delays and retries
//! - `QueueNames`: environment-namespaced queue and key naming
//! - `KeyValueStore`: TTL counters backing provider rate tracking

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pq_common::{Job, JobProgress, JobState, PriorityLevel, QueueCounts, RetryPolicy};

pub mod error;
pub mod kv;
pub mod memory;
pub mod naming;

#[cfg(feature = "redis")]
pub mod redis_kv;

pub use error::QueueError;
pub use kv::{KeyValueStore, MemoryKeyValueStore};
pub use memory::MemoryQueue;
pub use naming::{display_name, QueueNames};

#[cfg(feature = "redis")]
pub use redis_kv::RedisKeyValueStore;

pub type Result<T> = std::result::Result<T, QueueError>;

/// A job as submitted by a producer, before the backend assigns identity.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub payload: serde_json::Value,
    pub priority: PriorityLevel,
    pub policy: RetryPolicy,
    /// Hold the job in the delayed set before it becomes eligible.
    pub delay: Option<Duration>,
    /// Enqueueing a key that is already present returns the existing job.
    pub dedupe_key: Option<String>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            priority: PriorityLevel::Normal,
            policy: RetryPolicy::default(),
            delay: None,
            dedupe_key: None,
        }
    }

    pub fn with_priority(mut self, priority: PriorityLevel) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// A job handed to a worker together with its lock token.
#[derive(Debug, Clone)]
pub struct LockedJob {
    pub job: Job,
    pub token: String,
    pub lock_expires_at: DateTime<Utc>,
}

/// Result of reporting a failed attempt.
#[derive(Debug, Clone)]
pub struct FailOutcome {
    pub job: Job,
    /// Set when the backend scheduled another delivery.
    pub retry_at: Option<DateTime<Utc>>,
}

impl FailOutcome {
    pub fn will_retry(&self) -> bool {
        self.retry_at.is_some()
    }
}

/// An active job whose lock expired before it finished.
#[derive(Debug, Clone)]
pub struct StalledJob {
    pub job: Job,
    /// True when the stall limit was exceeded and the job moved to Failed.
    pub failed: bool,
}

/// Capability set of a persistent job-queue backend.
///
/// Ordering contract: among eligible jobs the lowest priority value is
/// reserved first, equal priorities in insertion order.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Fully namespaced queue name
    fn name(&self) -> &str;

    async fn enqueue(&self, job: NewJob) -> Result<Job>;

    /// Enqueue all jobs or none.
    async fn enqueue_bulk(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>>;

    /// Take the next eligible job and lock it for `lock_duration`.
    /// Returns `None` when nothing is eligible or the queue is paused.
    async fn reserve(&self, lock_duration: Duration) -> Result<Option<LockedJob>>;

    async fn renew_lock(&self, job_id: &str, token: &str, lock_duration: Duration) -> Result<DateTime<Utc>>;

    async fn complete(&self, job_id: &str, token: &str, result: serde_json::Value) -> Result<Job>;

    /// Record a failed attempt. Schedules a retry using the job's backoff
    /// while attempts remain, otherwise moves the job to Failed.
    async fn fail(&self, job_id: &str, token: &str, error: &str) -> Result<FailOutcome>;

    /// Move an active job straight to Failed regardless of remaining attempts.
    async fn discard(&self, job_id: &str, token: &str, error: &str) -> Result<Job>;

    async fn update_progress(&self, job_id: &str, progress: JobProgress) -> Result<Job>;

    /// Find active jobs whose lock expired. Each is re-queued, or failed once
    /// its stall count exceeds `max_stalled_count`.
    async fn recover_stalled(&self, max_stalled_count: u32) -> Result<Vec<StalledJob>>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Remove every waiting and delayed job. Returns removed ids.
    async fn drain(&self) -> Result<Vec<String>>;

    /// Remove terminal jobs in `state` that finished more than `grace` ago.
    async fn clean(&self, state: JobState, grace: Duration) -> Result<Vec<String>>;

    async fn counts(&self) -> Result<QueueCounts>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Job currently holding `key`, if any.
    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<Job>>;
}
