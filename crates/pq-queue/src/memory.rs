//! Embedded in-process queue backend.
//!
//! Mirrors the semantics of a Redis-backed job queue for a single process:
//! priority + FIFO waiting set, delayed set for backoff, lock tokens with
//! expiry for active jobs, and retained terminal jobs for cleaning.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use pq_common::{Job, JobProgress, JobState, PriorityLevel, QueueCounts};

use crate::{FailOutcome, LockedJob, NewJob, QueueBackend, QueueError, Result, StalledJob};

struct ActiveLock {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    /// (priority, sequence, job id) - iteration order is serving order
    waiting: BTreeSet<(PriorityLevel, u64, String)>,
    /// (eligible at, sequence, job id)
    delayed: BTreeSet<(DateTime<Utc>, u64, String)>,
    active: HashMap<String, ActiveLock>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    dedupe: HashMap<String, String>,
    paused: bool,
    next_seq: u64,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn push_waiting(&mut self, job_id: &str, priority: PriorityLevel) {
        let seq = self.next_seq();
        self.waiting.insert((priority, seq, job_id.to_string()));
    }

    fn push_delayed(&mut self, job_id: &str, at: DateTime<Utc>) {
        let seq = self.next_seq();
        self.delayed.insert((at, seq, job_id.to_string()));
    }

    /// Move delayed jobs whose time has come into the waiting set.
    fn promote_delayed(&mut self, now: DateTime<Utc>) {
        while let Some(first) = self.delayed.first() {
            if first.0 > now {
                break;
            }
            let Some((_, _, job_id)) = self.delayed.pop_first() else {
                break;
            };
            let priority = match self.jobs.get_mut(&job_id) {
                Some(job) => {
                    job.state = JobState::Waiting;
                    job.delay_until = None;
                    job.priority
                }
                None => continue,
            };
            self.push_waiting(&job_id, priority);
        }
    }

    fn check_lock(&self, job_id: &str, token: &str) -> Result<()> {
        match self.active.get(job_id) {
            Some(lock) if lock.token == token => Ok(()),
            _ => Err(QueueError::LockMismatch(job_id.to_string())),
        }
    }

    fn remove_job(&mut self, job_id: &str) -> Option<Job> {
        let job = self.jobs.remove(job_id)?;
        if let Some(key) = &job.dedupe_key {
            if self.dedupe.get(key).map(|id| id == job_id).unwrap_or(false) {
                self.dedupe.remove(key);
            }
        }
        Some(job)
    }

    fn insert_new(&mut self, queue_name: &str, new_job: NewJob, now: DateTime<Utc>) -> Job {
        if let Some(existing) = new_job
            .dedupe_key
            .as_ref()
            .and_then(|key| self.dedupe.get(key))
            .and_then(|id| self.jobs.get(id))
        {
            debug!(job_id = %existing.id, "Duplicate job key, returning existing job");
            return existing.clone();
        }

        let delay_until = new_job
            .delay
            .filter(|d| !d.is_zero())
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);

        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            queue_name: queue_name.to_string(),
            name: new_job.name,
            payload: new_job.payload,
            priority: new_job.priority,
            attempts_made: 0,
            max_attempts: new_job.policy.attempts.max(1),
            backoff: new_job.policy.backoff,
            state: if delay_until.is_some() { JobState::Delayed } else { JobState::Waiting },
            progress: None,
            stalled_count: 0,
            dedupe_key: new_job.dedupe_key,
            created_at: now,
            delay_until,
            processed_at: None,
            finished_at: None,
            return_value: None,
            failed_reason: None,
        };

        if let Some(key) = &job.dedupe_key {
            self.dedupe.insert(key.clone(), job.id.clone());
        }
        match delay_until {
            Some(at) => self.push_delayed(&job.id, at),
            None => self.push_waiting(&job.id, job.priority),
        }
        self.jobs.insert(job.id.clone(), job.clone());
        job
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn validate(job: &NewJob) -> Result<()> {
    if job.name.trim().is_empty() {
        return Err(QueueError::InvalidJob("job name must not be empty".to_string()));
    }
    Ok(())
}

/// In-memory queue backend for embedded and test use.
pub struct MemoryQueue {
    name: String,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        info!(queue = %name, "Embedded queue created");
        Self {
            name,
            state: Mutex::new(QueueState::default()),
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        validate(&job)?;
        let mut state = self.state.lock();
        let job = state.insert_new(&self.name, job, Utc::now());
        debug!(queue = %self.name, job_id = %job.id, priority = %job.priority, "Job enqueued");
        Ok(job)
    }

    async fn enqueue_bulk(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>> {
        for job in &jobs {
            validate(job)?;
        }
        let now = Utc::now();
        let mut state = self.state.lock();
        let created: Vec<Job> = jobs
            .into_iter()
            .map(|job| state.insert_new(&self.name, job, now))
            .collect();
        debug!(queue = %self.name, count = created.len(), "Bulk enqueued");
        Ok(created)
    }

    async fn reserve(&self, lock_duration: Duration) -> Result<Option<LockedJob>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        if state.paused {
            return Ok(None);
        }
        state.promote_delayed(now);

        let Some((_, _, job_id)) = state.waiting.pop_first() else {
            return Ok(None);
        };

        let token = uuid::Uuid::new_v4().to_string();
        let lock_expires_at = now + to_chrono(lock_duration);
        let job = match state.jobs.get_mut(&job_id) {
            Some(job) => {
                job.state = JobState::Active;
                job.processed_at = Some(now);
                job.clone()
            }
            None => return Err(QueueError::NotFound(job_id)),
        };
        state.active.insert(
            job_id,
            ActiveLock { token: token.clone(), expires_at: lock_expires_at },
        );

        Ok(Some(LockedJob { job, token, lock_expires_at }))
    }

    async fn renew_lock(&self, job_id: &str, token: &str, lock_duration: Duration) -> Result<DateTime<Utc>> {
        let mut state = self.state.lock();
        state.check_lock(job_id, token)?;
        let expires_at = Utc::now() + to_chrono(lock_duration);
        if let Some(lock) = state.active.get_mut(job_id) {
            lock.expires_at = expires_at;
        }
        Ok(expires_at)
    }

    async fn complete(&self, job_id: &str, token: &str, result: serde_json::Value) -> Result<Job> {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.check_lock(job_id, token)?;
        state.active.remove(job_id);

        let job = match state.jobs.get_mut(job_id) {
            Some(job) => {
                job.attempts_made = (job.attempts_made + 1).min(job.max_attempts);
                job.state = JobState::Completed;
                job.finished_at = Some(now);
                job.return_value = Some(result);
                job.clone()
            }
            None => return Err(QueueError::NotFound(job_id.to_string())),
        };
        state.completed.push_back(job.id.clone());
        Ok(job)
    }

    async fn fail(&self, job_id: &str, token: &str, error: &str) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.check_lock(job_id, token)?;
        state.active.remove(job_id);

        let job = match state.jobs.get_mut(job_id) {
            Some(job) => {
                job.attempts_made = (job.attempts_made + 1).min(job.max_attempts);
                job.failed_reason = Some(error.to_string());
                job
            }
            None => return Err(QueueError::NotFound(job_id.to_string())),
        };

        if job.has_attempts_remaining() {
            let delay = job.backoff.delay_for(job.attempts_made);
            let retry_at = now + to_chrono(delay);
            let priority = job.priority;
            let snapshot = if delay.is_zero() {
                job.state = JobState::Waiting;
                let snapshot = job.clone();
                state.push_waiting(job_id, priority);
                snapshot
            } else {
                job.state = JobState::Delayed;
                job.delay_until = Some(retry_at);
                let snapshot = job.clone();
                state.push_delayed(job_id, retry_at);
                snapshot
            };
            debug!(
                job_id = %job_id,
                attempts_made = snapshot.attempts_made,
                delay_ms = delay.as_millis() as u64,
                "Job attempt failed, retry scheduled"
            );
            return Ok(FailOutcome { job: snapshot, retry_at: Some(retry_at) });
        }

        job.state = JobState::Failed;
        job.finished_at = Some(now);
        let snapshot = job.clone();
        state.failed.push_back(job_id.to_string());
        Ok(FailOutcome { job: snapshot, retry_at: None })
    }

    async fn discard(&self, job_id: &str, token: &str, error: &str) -> Result<Job> {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.check_lock(job_id, token)?;
        state.active.remove(job_id);

        let job = match state.jobs.get_mut(job_id) {
            Some(job) => {
                job.attempts_made = (job.attempts_made + 1).min(job.max_attempts);
                job.failed_reason = Some(error.to_string());
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                job.clone()
            }
            None => return Err(QueueError::NotFound(job_id.to_string())),
        };
        state.failed.push_back(job.id.clone());
        debug!(job_id = %job_id, "Job discarded without retry");
        Ok(job)
    }

    async fn update_progress(&self, job_id: &str, progress: JobProgress) -> Result<Job> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        job.progress = Some(progress);
        Ok(job.clone())
    }

    async fn recover_stalled(&self, max_stalled_count: u32) -> Result<Vec<StalledJob>> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, lock)| lock.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut stalled = Vec::with_capacity(expired.len());
        for job_id in expired {
            state.active.remove(&job_id);
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            job.stalled_count += 1;

            if job.stalled_count > max_stalled_count {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                job.failed_reason = Some("job stalled more than allowable limit".to_string());
                let snapshot = job.clone();
                state.failed.push_back(job_id.clone());
                warn!(job_id = %job_id, stalled_count = snapshot.stalled_count, "Stalled job failed");
                stalled.push(StalledJob { job: snapshot, failed: true });
            } else {
                job.state = JobState::Waiting;
                let priority = job.priority;
                let snapshot = job.clone();
                state.push_waiting(&job_id, priority);
                warn!(job_id = %job_id, stalled_count = snapshot.stalled_count, "Stalled job re-queued");
                stalled.push(StalledJob { job: snapshot, failed: false });
            }
        }

        Ok(stalled)
    }

    async fn pause(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.paused {
            state.paused = true;
            info!(queue = %self.name, "Queue paused");
        }
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.paused {
            state.paused = false;
            info!(queue = %self.name, "Queue resumed");
        }
        Ok(())
    }

    async fn drain(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        let waiting = std::mem::take(&mut state.waiting);
        let delayed = std::mem::take(&mut state.delayed);

        let ids: Vec<String> = waiting
            .into_iter()
            .map(|(_, _, id)| id)
            .chain(delayed.into_iter().map(|(_, _, id)| id))
            .collect();
        for id in &ids {
            state.remove_job(id);
        }
        info!(queue = %self.name, removed = ids.len(), "Queue drained");
        Ok(ids)
    }

    async fn clean(&self, target: JobState, grace: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now() - to_chrono(grace);
        let mut state = self.state.lock();

        let list = match target {
            JobState::Completed => std::mem::take(&mut state.completed),
            JobState::Failed => std::mem::take(&mut state.failed),
            other => return Err(QueueError::InvalidState(other)),
        };

        let mut kept = VecDeque::with_capacity(list.len());
        let mut removed = Vec::new();
        for id in list {
            let expired = state
                .jobs
                .get(&id)
                .and_then(|job| job.finished_at)
                .map(|finished| finished <= cutoff)
                .unwrap_or(true);
            if expired {
                state.remove_job(&id);
                removed.push(id);
            } else {
                kept.push_back(id);
            }
        }

        match target {
            JobState::Completed => state.completed = kept,
            _ => state.failed = kept,
        }
        debug!(queue = %self.name, state = ?target, removed = removed.len(), "Cleaned jobs");
        Ok(removed)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let mut state = self.state.lock();
        state.promote_delayed(Utc::now());
        Ok(QueueCounts {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
            delayed: state.delayed.len() as u64,
            paused: state.paused,
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.state.lock().jobs.get(job_id).cloned())
    }

    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<Job>> {
        let state = self.state.lock();
        Ok(state.dedupe.get(key).and_then(|id| state.jobs.get(id)).cloned())
    }
}
