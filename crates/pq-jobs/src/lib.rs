//! PixelQ Job Processing
//!
//! This crate provides background job dispatch on top of a `QueueBackend`:
//! - RetryPolicyRegistry: per-job-type attempts, backoff, timeout and rate limit
//! - PriorityMapper: subscription tier to priority level
//! - JobProducer: enqueue with merged defaults plus administrative operations
//! - JobConsumer: bounded-concurrency handler execution with lifecycle events
//! - MetricsHookBus: per-event and global listener fan-out
//! - JobMetricsCollector / JobDurationTracker: sliding window job metrics

pub mod consumer;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod priority;
pub mod producer;
pub mod retry;
pub mod telemetry;

pub use consumer::{ConsumerConfig, JobConsumer, JobContext, JobHandler};
pub use error::{JobError, UnrecoverableError};
pub use hooks::{ListenerId, MetricsHookBus};
pub use metrics::{JobDurationTracker, JobMetricsCollector, MetricsConfig};
pub use priority::PriorityMapper;
pub use producer::{BulkJob, JobOptions, JobProducer};
pub use retry::{JobTypePolicy, RetryPolicyRegistry, DEFAULT_JOB_TIMEOUT};

pub type Result<T> = std::result::Result<T, JobError>;
