//! Per-job-type retry, timeout and rate-limit tables.

use std::collections::HashMap;
use std::time::Duration;

use pq_common::{Backoff, BackoffKind, JobRateLimit, RetryPolicy};
use pq_config::JobTypeConfig;

/// Lock timeout for job types without an entry.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Everything the dispatch layer knows about one job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTypePolicy {
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub rate_limit: Option<JobRateLimit>,
}

impl JobTypePolicy {
    fn new(attempts: u32, backoff: Backoff, timeout_ms: u64, rate_limit: Option<(u32, u64)>) -> Self {
        Self {
            retry: RetryPolicy::new(attempts, backoff),
            timeout: Duration::from_millis(timeout_ms),
            rate_limit: rate_limit.map(|(max, window_ms)| JobRateLimit { max, window_ms }),
        }
    }
}

impl Default for JobTypePolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: DEFAULT_JOB_TIMEOUT,
            rate_limit: None,
        }
    }
}

/// Lookup table keyed by job type. Unknown types get
/// `{3 attempts, exponential, 1000ms}`, a 60s timeout and no rate limit.
#[derive(Debug, Clone)]
pub struct RetryPolicyRegistry {
    entries: HashMap<String, JobTypePolicy>,
}

impl RetryPolicyRegistry {
    /// Registry with the built-in job types.
    pub fn new() -> Self {
        let entries = [
            ("image-generation", JobTypePolicy::new(3, Backoff::exponential(2000), 120_000, Some((60, 60_000)))),
            ("image-upscale", JobTypePolicy::new(3, Backoff::exponential(2000), 180_000, Some((30, 60_000)))),
            ("video-generation", JobTypePolicy::new(2, Backoff::exponential(5000), 600_000, Some((10, 60_000)))),
            ("notification", JobTypePolicy::new(5, Backoff::fixed(500), 10_000, Some((30, 1_000)))),
            ("payment-webhook", JobTypePolicy::new(5, Backoff::exponential(1000), 30_000, None)),
            ("cleanup", JobTypePolicy::new(1, Backoff::fixed(0), 300_000, None)),
        ]
        .into_iter()
        .map(|(name, policy)| (name.to_string(), policy))
        .collect();

        Self { entries }
    }

    /// Built-in table with configured overrides applied on top. An override
    /// for an unknown job type starts from the default entry.
    pub fn with_overrides(overrides: &HashMap<String, JobTypeConfig>) -> Self {
        let mut registry = Self::new();
        for (job_type, cfg) in overrides {
            let mut policy = registry.policy(job_type);

            if let Some(attempts) = cfg.attempts {
                policy.retry = RetryPolicy::new(attempts, policy.retry.backoff);
            }
            if let Some(kind) = cfg.backoff {
                policy.retry.backoff.kind = kind;
            }
            if let Some(delay_ms) = cfg.backoff_delay_ms {
                policy.retry.backoff.delay_ms = delay_ms;
            }
            if let Some(timeout_ms) = cfg.timeout_ms {
                policy.timeout = Duration::from_millis(timeout_ms);
            }
            if let (Some(max), Some(window_ms)) = (cfg.rate_limit_max, cfg.rate_limit_window_ms) {
                policy.rate_limit = Some(JobRateLimit { max, window_ms });
            }

            registry.insert(job_type.clone(), policy);
        }
        registry
    }

    pub fn insert(&mut self, job_type: impl Into<String>, policy: JobTypePolicy) {
        self.entries.insert(job_type.into(), policy);
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.entries.contains_key(job_type)
    }

    /// Full entry, or the default entry for unknown types.
    pub fn policy(&self, job_type: &str) -> JobTypePolicy {
        self.entries.get(job_type).copied().unwrap_or_default()
    }

    pub fn get_retry_config(&self, job_type: &str) -> RetryPolicy {
        self.policy(job_type).retry
    }

    pub fn get_timeout(&self, job_type: &str) -> Duration {
        self.policy(job_type).timeout
    }

    pub fn get_rate_limit(&self, job_type: &str) -> Option<JobRateLimit> {
        self.policy(job_type).rate_limit
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl Default for RetryPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shorthand used in logs.
pub fn describe_backoff(backoff: &Backoff) -> &'static str {
    match backoff.kind {
        BackoffKind::Fixed => "fixed",
        BackoffKind::Exponential => "exponential",
    }
}
