//! Prometheus metrics for job processing
//!
//! - Jobs enqueued / processed by type and outcome
//! - Handler duration
//! - Stalled jobs and rate-limit waits
//! - Queue depth gauges
//! - Hook listener failures

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use pq_common::{PriorityLevel, QueueCounts};

/// Record a job entering the queue
pub fn record_job_enqueued(queue: &str, job_type: &str, priority: PriorityLevel) {
    counter!(
        "pq_jobs_enqueued_total",
        "queue" => queue.to_string(),
        "job_type" => job_type.to_string(),
        "priority" => priority.label().to_string()
    )
    .increment(1);
}

/// Record a finished handler invocation
pub fn record_job_processed(queue: &str, job_type: &str, outcome: &str) {
    counter!(
        "pq_jobs_processed_total",
        "queue" => queue.to_string(),
        "job_type" => job_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_job_duration(queue: &str, job_type: &str, duration: Duration) {
    histogram!(
        "pq_job_duration_seconds",
        "queue" => queue.to_string(),
        "job_type" => job_type.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_job_stalled(queue: &str) {
    counter!("pq_jobs_stalled_total", "queue" => queue.to_string()).increment(1);
}

/// Record a handler invocation delayed by the job-type rate limit
pub fn record_job_rate_limited(job_type: &str) {
    counter!("pq_job_rate_limited_total", "job_type" => job_type.to_string()).increment(1);
}

pub fn set_active_jobs(queue: &str, count: u32) {
    gauge!("pq_active_jobs", "queue" => queue.to_string()).set(count as f64);
}

/// Update queue depth gauges from a counts snapshot
pub fn set_queue_depth(queue: &str, counts: &QueueCounts) {
    for (state, value) in [
        ("waiting", counts.waiting),
        ("active", counts.active),
        ("delayed", counts.delayed),
        ("completed", counts.completed),
        ("failed", counts.failed),
    ] {
        gauge!(
            "pq_queue_jobs",
            "queue" => queue.to_string(),
            "state" => state
        )
        .set(value as f64);
    }
}

pub fn record_hook_failure(event: &str) {
    counter!("pq_hook_listener_failures_total", "event" => event.to_string()).increment(1);
}

pub fn record_backend_error(queue: &str, operation: &str) {
    counter!(
        "pq_queue_backend_errors_total",
        "queue" => queue.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}
