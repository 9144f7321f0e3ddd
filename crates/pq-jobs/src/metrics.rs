//! Job Metrics Collection
//!
//! Sliding window metrics for one queue:
//! - Completed/failed/stalled counters
//! - Processing time tracking with percentiles
//! - 5-minute and 30-minute time windows
//!
//! `JobDurationTracker` feeds the collector from the hook bus by pairing a
//! job's Active event with its Completed or Failed event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use pq_common::{
    JobMetricsSnapshot, ProcessingTimeMetrics, QueueEventKind, QueueEventPayload, WindowedMetrics,
};

use crate::hooks::{ListenerId, MetricsHookBus};
use crate::telemetry;

#[derive(Debug, Clone)]
struct MetricSample {
    timestamp: Instant,
    duration_ms: u64,
    success: bool,
}

/// Configuration for the metrics collector
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Maximum samples to retain for percentile calculations
    pub max_samples: usize,
    pub short_window: Duration,
    pub long_window: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_samples: 10000,
            short_window: Duration::from_secs(300),
            long_window: Duration::from_secs(1800),
        }
    }
}

/// Thread-safe metrics collector for a job queue
pub struct JobMetricsCollector {
    config: MetricsConfig,

    total_completed: AtomicU64,
    total_failed: AtomicU64,
    total_stalled: AtomicU64,

    samples: RwLock<VecDeque<MetricSample>>,
}

impl JobMetricsCollector {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            config,
            total_completed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_stalled: AtomicU64::new(0),
            samples: RwLock::new(VecDeque::with_capacity(1024)),
        }
    }

    pub fn record_completed(&self, duration_ms: u64) {
        self.total_completed.fetch_add(1, Ordering::Relaxed);
        self.add_sample(duration_ms, true);
    }

    pub fn record_failed(&self, duration_ms: u64) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        self.add_sample(duration_ms, false);
    }

    /// Stalls carry no duration; the job has not finished.
    pub fn record_stalled(&self) {
        self.total_stalled.fetch_add(1, Ordering::Relaxed);
    }

    fn add_sample(&self, duration_ms: u64, success: bool) {
        let now = Instant::now();
        let mut samples = self.samples.write();

        if let Some(cutoff) = now.checked_sub(self.config.long_window) {
            while samples.front().map(|s| s.timestamp < cutoff).unwrap_or(false) {
                samples.pop_front();
            }
        }

        samples.push_back(MetricSample {
            timestamp: now,
            duration_ms,
            success,
        });

        while samples.len() > self.config.max_samples {
            samples.pop_front();
        }
    }

    pub fn total_completed(&self) -> u64 {
        self.total_completed.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.total_failed.load(Ordering::Relaxed)
    }

    pub fn get_metrics(&self) -> JobMetricsSnapshot {
        let samples = self.samples.read();
        let now = Instant::now();

        let total_completed = self.total_completed();
        let total_failed = self.total_failed();
        let total = total_completed + total_failed;
        let success_rate = if total > 0 {
            total_completed as f64 / total as f64
        } else {
            1.0
        };

        let all_durations: Vec<u64> = samples.iter().map(|s| s.duration_ms).collect();
        let processing_time = Self::calculate_processing_time_metrics(&all_durations);

        let window = |length: Duration| {
            let in_window: Vec<&MetricSample> = match now.checked_sub(length) {
                Some(cutoff) => samples.iter().filter(|s| s.timestamp >= cutoff).collect(),
                None => samples.iter().collect(),
            };
            Self::calculate_windowed_metrics(&in_window, length)
        };

        JobMetricsSnapshot {
            total_completed,
            total_failed,
            total_stalled: self.total_stalled.load(Ordering::Relaxed),
            success_rate,
            processing_time,
            last_5_min: window(self.config.short_window),
            last_30_min: window(self.config.long_window),
        }
    }

    fn calculate_processing_time_metrics(durations: &[u64]) -> ProcessingTimeMetrics {
        if durations.is_empty() {
            return ProcessingTimeMetrics::default();
        }

        let mut sorted = durations.to_vec();
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len() as u64;

        ProcessingTimeMetrics {
            avg_ms: sum as f64 / count as f64,
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            p50_ms: Self::percentile(&sorted, 50.0),
            p95_ms: Self::percentile(&sorted, 95.0),
            p99_ms: Self::percentile(&sorted, 99.0),
            sample_count: count,
        }
    }

    fn calculate_windowed_metrics(samples: &[&MetricSample], window_duration: Duration) -> WindowedMetrics {
        let completed_count = samples.iter().filter(|s| s.success).count() as u64;
        let failed_count = samples.len() as u64 - completed_count;
        let total = completed_count + failed_count;

        let success_rate = if total > 0 {
            completed_count as f64 / total as f64
        } else {
            1.0
        };

        let window_secs = window_duration.as_secs_f64();
        let throughput_per_sec = if window_secs > 0.0 {
            total as f64 / window_secs
        } else {
            0.0
        };

        let durations: Vec<u64> = samples.iter().map(|s| s.duration_ms).collect();

        WindowedMetrics {
            completed_count,
            failed_count,
            success_rate,
            throughput_per_sec,
            processing_time: Self::calculate_processing_time_metrics(&durations),
            window_start: Utc::now() - chrono::Duration::seconds(window_duration.as_secs() as i64),
            window_duration_secs: window_duration.as_secs(),
        }
    }

    /// Percentile from sorted data, nearest-rank with rounding
    fn percentile(sorted: &[u64], p: f64) -> u64 {
        if sorted.is_empty() {
            return 0;
        }
        let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn reset(&self) {
        self.total_completed.store(0, Ordering::Relaxed);
        self.total_failed.store(0, Ordering::Relaxed);
        self.total_stalled.store(0, Ordering::Relaxed);
        self.samples.write().clear();
    }
}

impl Default for JobMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook adapter measuring job duration with its own clock.
///
/// Active stores a start instant per job id; Completed and Failed take it
/// and record the elapsed time. A Stalled job's start is discarded since
/// the next delivery starts a new measurement.
pub struct JobDurationTracker {
    started: DashMap<String, Instant>,
    collector: Arc<JobMetricsCollector>,
}

impl JobDurationTracker {
    pub fn new(collector: Arc<JobMetricsCollector>) -> Arc<Self> {
        Arc::new(Self {
            started: DashMap::new(),
            collector,
        })
    }

    /// Register on the lifecycle events it needs.
    pub fn install(self: &Arc<Self>, bus: &MetricsHookBus) -> Vec<ListenerId> {
        [
            QueueEventKind::Active,
            QueueEventKind::Completed,
            QueueEventKind::Failed,
            QueueEventKind::Stalled,
        ]
        .into_iter()
        .map(|kind| {
            let tracker = Arc::clone(self);
            bus.on(kind, move |payload| {
                tracker.observe(payload);
                Ok(())
            })
        })
        .collect()
    }

    pub fn observe(&self, payload: &QueueEventPayload) {
        match payload.kind {
            QueueEventKind::Active => {
                self.started.insert(payload.job_id.clone(), Instant::now());
            }
            QueueEventKind::Completed | QueueEventKind::Failed => {
                let Some((_, started)) = self.started.remove(&payload.job_id) else {
                    return;
                };
                let elapsed = started.elapsed();
                let duration_ms = elapsed.as_millis() as u64;
                if payload.kind == QueueEventKind::Completed {
                    self.collector.record_completed(duration_ms);
                } else {
                    self.collector.record_failed(duration_ms);
                }
                telemetry::record_job_duration(
                    &payload.queue_name,
                    payload.job_name.as_deref().unwrap_or("unknown"),
                    elapsed,
                );
            }
            QueueEventKind::Stalled => {
                self.started.remove(&payload.job_id);
                self.collector.record_stalled();
            }
            _ => {}
        }
    }

    /// Jobs seen Active without a terminal event yet
    pub fn in_flight(&self) -> usize {
        self.started.len()
    }

    pub fn collector(&self) -> &Arc<JobMetricsCollector> {
        &self.collector
    }
}
