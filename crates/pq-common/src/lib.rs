use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod logging;

// ============================================================================
// Priority
// ============================================================================

/// Ordinal job importance. Lower numeric value is served first.
///
/// The derived `Ord` follows the numeric value, so `Critical < Background`
/// and sorting ascending yields the serving order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityLevel {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
    Background = 5,
}

impl PriorityLevel {
    /// All levels, highest priority first.
    pub const ALL: [PriorityLevel; 5] = [
        PriorityLevel::Critical,
        PriorityLevel::High,
        PriorityLevel::Normal,
        PriorityLevel::Low,
        PriorityLevel::Background,
    ];

    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            PriorityLevel::Critical => "Critical",
            PriorityLevel::High => "High",
            PriorityLevel::Normal => "Normal",
            PriorityLevel::Low => "Low",
            PriorityLevel::Background => "Background",
        }
    }

    /// Negative when `a` is served before `b`, zero when equal.
    pub fn compare(a: PriorityLevel, b: PriorityLevel) -> i32 {
        a.value() as i32 - b.value() as i32
    }

    /// Case-insensitive parse. Unknown input maps to `Normal`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => PriorityLevel::Critical,
            "high" => PriorityLevel::High,
            "normal" => PriorityLevel::Normal,
            "low" => PriorityLevel::Low,
            "background" => PriorityLevel::Background,
            _ => PriorityLevel::Normal,
        }
    }

    /// Exact ordinal lookup.
    pub fn from_ordinal(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.value() == value)
    }

    /// Level whose ordinal is nearest `value`.
    ///
    /// Scans `ALL` in order and keeps the first candidate with the smallest
    /// distance, so a tie (e.g. 2.5) resolves to the higher priority.
    pub fn from_value(value: f64) -> Self {
        let mut best = PriorityLevel::Normal;
        let mut best_distance = f64::INFINITY;
        for level in Self::ALL {
            let distance = (level.value() as f64 - value).abs();
            if distance < best_distance {
                best = level;
                best_distance = distance;
            }
        }
        best
    }
}

impl Default for PriorityLevel {
    fn default() -> Self {
        PriorityLevel::Normal
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Retry / Backoff
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Inter-retry delay strategy attached to every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl Backoff {
    pub fn fixed(delay_ms: u64) -> Self {
        Self { kind: BackoffKind::Fixed, delay_ms }
    }

    pub fn exponential(delay_ms: u64) -> Self {
        Self { kind: BackoffKind::Exponential, delay_ms }
    }

    /// Delay before the next delivery after `attempts_made` failed attempts.
    ///
    /// Exponential doubles per attempt: base, 2*base, 4*base, ...
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                self.delay_ms.saturating_mul(1u64 << exponent)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Attempts plus backoff for one job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self { attempts: attempts.max(1), backoff }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::exponential(1000),
        }
    }
}

/// Maximum number of executions allowed within a time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRateLimit {
    pub max: u32,
    pub window_ms: u64,
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Progress reported by a running handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobProgress {
    Percent(f64),
    Data(serde_json::Value),
}

impl JobProgress {
    /// Percentage clamped into 0..=100.
    pub fn percent(value: f64) -> Self {
        JobProgress::Percent(value.clamp(0.0, 100.0))
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            JobProgress::Percent(p) => serde_json::json!(p),
            JobProgress::Data(v) => v.clone(),
        }
    }
}

/// A unit of background work.
///
/// Created by the producer at enqueue time; afterwards only the consumer
/// (through the queue backend) mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue_name: String,
    /// Job type, used to look up retry/timeout/rate-limit tables.
    pub name: String,
    pub payload: serde_json::Value,
    pub priority: PriorityLevel,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub state: JobState,
    #[serde(default)]
    pub progress: Option<JobProgress>,
    #[serde(default)]
    pub stalled_count: u32,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delay_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub return_value: Option<serde_json::Value>,
    #[serde(default)]
    pub failed_reason: Option<String>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether another delivery is allowed after the current attempt fails.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

// ============================================================================
// Queue Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueEventKind {
    Added,
    Active,
    Progress,
    Completed,
    Failed,
    Stalled,
    Removed,
}

impl QueueEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueEventKind::Added => "added",
            QueueEventKind::Active => "active",
            QueueEventKind::Progress => "progress",
            QueueEventKind::Completed => "completed",
            QueueEventKind::Failed => "failed",
            QueueEventKind::Stalled => "stalled",
            QueueEventKind::Removed => "removed",
        }
    }
}

impl fmt::Display for QueueEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event delivered to hook listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEventPayload {
    pub job_id: String,
    pub queue_name: String,
    pub kind: QueueEventKind,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl QueueEventPayload {
    pub fn new(kind: QueueEventKind, job_id: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            queue_name: queue_name.into(),
            kind,
            job_name: None,
            data: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_job(kind: QueueEventKind, job: &Job) -> Self {
        let mut payload = Self::new(kind, job.id.clone(), job.queue_name.clone());
        payload.job_name = Some(job.name.clone());
        payload
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Point-in-time queue counts returned by every administrative operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: bool,
}

// ============================================================================
// Generation
// ============================================================================

fn default_dimension() -> u32 {
    1024
}

fn default_num_images() -> u32 {
    1
}

/// Input to a generation provider. Opaque to the dispatch core apart from
/// the prompt (moderation) and model (selection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_num_images")]
    pub num_images: u32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            model: None,
            width: default_dimension(),
            height: default_dimension(),
            num_images: default_num_images(),
            seed: None,
            user_id: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_num_images(mut self, num_images: u32) -> Self {
        self.num_images = num_images;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub url: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    pub images: Vec<GeneratedImage>,
    pub cost: f64,
    #[serde(default)]
    pub provider_job_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Append-only ledger entry, one per provider tried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostRecord {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Missing cost counts as zero when totalled.
    #[serde(default)]
    pub cost: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub successful: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl CostRecord {
    pub fn success(provider: impl Into<String>, model: Option<String>, cost: f64, metadata: serde_json::Value) -> Self {
        Self {
            provider: provider.into(),
            model,
            cost: Some(cost),
            timestamp: Utc::now(),
            successful: true,
            metadata,
        }
    }

    pub fn failure(provider: impl Into<String>, model: Option<String>, error: &str, attempts: u32) -> Self {
        Self {
            provider: provider.into(),
            model,
            cost: Some(0.0),
            timestamp: Utc::now(),
            successful: false,
            metadata: serde_json::json!({ "error": error, "attempts": attempts }),
        }
    }
}

// ============================================================================
// Job Metrics
// ============================================================================

/// Snapshot of job execution metrics for one queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetricsSnapshot {
    /// Jobs completed (all time)
    pub total_completed: u64,
    /// Jobs failed (all time)
    pub total_failed: u64,
    /// Stalled events observed (all time)
    pub total_stalled: u64,
    /// Success rate (0.0 - 1.0)
    pub success_rate: f64,
    /// Processing time metrics (all retained samples)
    pub processing_time: ProcessingTimeMetrics,
    /// Metrics for the last 5 minutes
    pub last_5_min: WindowedMetrics,
    /// Metrics for the last 30 minutes
    pub last_30_min: WindowedMetrics,
}

/// Processing time metrics with percentiles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingTimeMetrics {
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub sample_count: u64,
}

/// Time-windowed metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowedMetrics {
    pub completed_count: u64,
    pub failed_count: u64,
    pub success_rate: f64,
    /// Jobs finished per second over the window
    pub throughput_per_sec: f64,
    pub processing_time: ProcessingTimeMetrics,
    pub window_start: DateTime<Utc>,
    pub window_duration_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_compare() {
        assert!(PriorityLevel::compare(PriorityLevel::Critical, PriorityLevel::Low) < 0);
        assert!(PriorityLevel::compare(PriorityLevel::Background, PriorityLevel::High) > 0);
        assert_eq!(PriorityLevel::compare(PriorityLevel::Normal, PriorityLevel::Normal), 0);
    }

    #[test]
    fn test_priority_from_str_lossy() {
        assert_eq!(PriorityLevel::from_str_lossy("HIGH"), PriorityLevel::High);
        assert_eq!(PriorityLevel::from_str_lossy(" background "), PriorityLevel::Background);
        assert_eq!(PriorityLevel::from_str_lossy("urgent"), PriorityLevel::Normal);
    }

    #[test]
    fn test_priority_from_value_nearest() {
        assert_eq!(PriorityLevel::from_value(1.0), PriorityLevel::Critical);
        assert_eq!(PriorityLevel::from_value(4.2), PriorityLevel::Low);
        assert_eq!(PriorityLevel::from_value(0.0), PriorityLevel::Critical);
        assert_eq!(PriorityLevel::from_value(99.0), PriorityLevel::Background);
        // Tie between High and Normal: first in scan order wins
        assert_eq!(PriorityLevel::from_value(2.5), PriorityLevel::High);
    }

    #[test]
    fn test_priority_sort_order() {
        let mut levels = vec![PriorityLevel::Low, PriorityLevel::Critical, PriorityLevel::Normal];
        levels.sort();
        assert_eq!(levels, vec![PriorityLevel::Critical, PriorityLevel::Normal, PriorityLevel::Low]);
    }

    #[test]
    fn test_backoff_delays() {
        let fixed = Backoff::fixed(500);
        assert_eq!(fixed.delay_for(1), Duration::from_millis(500));
        assert_eq!(fixed.delay_for(4), Duration::from_millis(500));

        let exp = Backoff::exponential(1000);
        assert_eq!(exp.delay_for(1), Duration::from_millis(1000));
        assert_eq!(exp.delay_for(2), Duration::from_millis(2000));
        assert_eq!(exp.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_generation_request_defaults() {
        let req: GenerationRequest = serde_json::from_str(r#"{"prompt":"a lighthouse"}"#).unwrap();
        assert_eq!(req.width, 1024);
        assert_eq!(req.height, 1024);
        assert_eq!(req.num_images, 1);
        assert!(req.model.is_none());
    }

    #[test]
    fn test_progress_serialization() {
        let pct = JobProgress::percent(140.0);
        assert_eq!(pct, JobProgress::Percent(100.0));
        assert_eq!(pct.to_value(), serde_json::json!(100.0));

        let data: JobProgress = serde_json::from_str(r#"{"step":"upscale"}"#).unwrap();
        assert!(matches!(data, JobProgress::Data(_)));
    }
}
