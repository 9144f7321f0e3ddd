//! PixelQ Configuration System
//!
//! TOML-based configuration with `PIXELQ_*` environment variable overrides.

use std::collections::HashMap;
use std::path::Path;

use pq_common::{BackoffKind, PriorityLevel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub queue: QueueConfig,
    /// Per-job-type overrides keyed by job type
    pub jobs: HashMap<String, JobTypeConfig>,
    /// Additional subscription tiers, tier name to priority
    pub tiers: HashMap<String, PriorityLevel>,
    pub orchestrator: OrchestratorConfig,
    pub moderation: ModerationConfig,
    pub redis: RedisConfig,
    pub providers: Vec<ProviderConfig>,
}

/// Queue and worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Namespace prefix for queue names
    pub prefix: String,
    /// Deployment environment appended to queue names
    pub environment: String,
    /// Queue the worker consumes
    pub name: String,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// How often active jobs are checked for expired locks
    pub stalled_interval_ms: u64,
    /// Stalls tolerated before a job is failed
    pub max_stalled_count: u32,
    pub lock_duration_ms: u64,
    pub lock_renew_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: "pixelq".to_string(),
            environment: "development".to_string(),
            name: "image-generation".to_string(),
            concurrency: 5,
            poll_interval_ms: 100,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
            lock_duration_ms: 30_000,
            lock_renew_interval_ms: 15_000,
        }
    }
}

/// Overrides for one job type. Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTypeConfig {
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffKind>,
    pub backoff_delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub rate_limit_max: Option<u32>,
    pub rate_limit_window_ms: Option<u64>,
}

/// Generation orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Attempts per provider before failing over
    pub max_retries: u32,
    /// Base delay between attempts on one provider
    pub retry_delay_ms: u64,
    /// Pause before moving to the next provider
    pub failover_delay_ms: u64,
    /// highest-priority, failover, lowest-cost, round-robin
    pub strategy: String,
    /// Model used by lowest-cost selection when the request names none
    pub default_model: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            failover_delay_ms: 1000,
            strategy: "highest-priority".to_string(),
            default_model: None,
        }
    }
}

/// Prompt moderation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    pub enabled: bool,
    pub blocked_terms: Vec<String>,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked_terms: Vec::new(),
        }
    }
}

/// Redis configuration for shared rate counters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// One HTTP generation provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub enabled: bool,
    /// Higher weight is preferred
    pub priority_weight: u32,
    /// Supported model ids, `*` for any
    pub models: Vec<String>,
    /// Cost per image at 1024x1024 keyed by model, `*` as fallback
    pub costs: HashMap<String, f64>,
    pub daily_limit: Option<u64>,
    pub minute_limit: Option<u64>,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    /// Consecutive 5xx or transport failures that trip the circuit
    pub circuit_failure_threshold: u32,
    /// Successful trial calls that close it again
    pub circuit_success_threshold: u32,
    pub circuit_cool_down_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            base_url: String::new(),
            api_key: None,
            enabled: true,
            priority_weight: 1,
            models: vec!["*".to_string()],
            costs: HashMap::new(),
            daily_limit: None,
            minute_limit: None,
            timeout_ms: 60_000,
            poll_interval_ms: 2_000,
            max_poll_attempts: 60,
            circuit_failure_threshold: 5,
            circuit_success_threshold: 2,
            circuit_cool_down_ms: 30_000,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.queue.prefix.is_empty() || self.queue.prefix.contains(':') {
            return invalid(format!("queue.prefix '{}' must be non-empty without ':'", self.queue.prefix));
        }
        if self.queue.environment.is_empty()
            || self.queue.environment.contains(':')
            || self.queue.environment.contains('-')
        {
            return invalid(format!(
                "queue.environment '{}' must be non-empty without ':' or '-'",
                self.queue.environment
            ));
        }
        if self.queue.name.is_empty() {
            return invalid("queue.name must not be empty".to_string());
        }
        if self.queue.concurrency == 0 {
            return invalid("queue.concurrency must be at least 1".to_string());
        }
        if self.queue.lock_renew_interval_ms == 0
            || self.queue.lock_renew_interval_ms >= self.queue.lock_duration_ms
        {
            return invalid("queue.lock_renew_interval_ms must be positive and below lock_duration_ms".to_string());
        }
        if self.orchestrator.max_retries == 0 {
            return invalid("orchestrator.max_retries must be at least 1".to_string());
        }

        for (job_type, job) in &self.jobs {
            if job.attempts == Some(0) {
                return invalid(format!("jobs.{}.attempts must be at least 1", job_type));
            }
            if job.rate_limit_window_ms == Some(0) || job.rate_limit_max == Some(0) {
                return invalid(format!("jobs.{} rate limit must be positive", job_type));
            }
            if job.rate_limit_max.is_some() != job.rate_limit_window_ms.is_some() {
                return invalid(format!(
                    "jobs.{} needs both rate_limit_max and rate_limit_window_ms",
                    job_type
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.is_empty() {
                return invalid("providers[].id must not be empty".to_string());
            }
            if !seen.insert(provider.id.as_str()) {
                return invalid(format!("duplicate provider id '{}'", provider.id));
            }
            if provider.base_url.is_empty() {
                return invalid(format!("provider '{}' has no base_url", provider.id));
            }
            if provider.models.is_empty() {
                return invalid(format!("provider '{}' supports no models", provider.id));
            }
            if provider.circuit_failure_threshold == 0 || provider.circuit_success_threshold == 0 {
                return invalid(format!("provider '{}' circuit thresholds must be at least 1", provider.id));
            }
        }

        if self.redis.enabled && self.redis.url.is_empty() {
            return invalid("redis.url must be set when redis is enabled".to_string());
        }

        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# PixelQ Configuration
# Environment variables (PIXELQ_*) override these settings

[queue]
prefix = "pixelq"
environment = "development"
name = "image-generation"
concurrency = 5
poll_interval_ms = 100
stalled_interval_ms = 30000
max_stalled_count = 1
lock_duration_ms = 30000
lock_renew_interval_ms = 15000

# Per-job-type overrides of the built-in retry table
[jobs.image-generation]
attempts = 4
backoff = "exponential"
backoff_delay_ms = 2000
timeout_ms = 120000
rate_limit_max = 60
rate_limit_window_ms = 60000

# Extra subscription tiers
[tiers]
Partner = "HIGH"

[orchestrator]
max_retries = 3
retry_delay_ms = 1000
failover_delay_ms = 1000
strategy = "highest-priority"  # highest-priority, failover, lowest-cost, round-robin
default_model = "sdxl"

[moderation]
enabled = true
blocked_terms = ["gore"]

[redis]
enabled = false
url = "redis://localhost:6379"

[[providers]]
id = "primary"
base_url = "https://api.primary.example"
priority_weight = 3
models = ["sdxl", "flux-dev"]
costs = { sdxl = 0.02, flux-dev = 0.04 }
daily_limit = 10000
minute_limit = 100
circuit_failure_threshold = 5
circuit_success_threshold = 2
circuit_cool_down_ms = 30000

[[providers]]
id = "fallback"
base_url = "https://api.fallback.example"
priority_weight = 1
models = ["*"]
costs = { "*" = 0.05 }
"#
        .to_string()
    }
}
