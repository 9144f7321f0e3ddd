//! Configuration loader with file and environment variable support

use std::env;
use std::path::PathBuf;

use tracing::info;

use crate::{AppConfig, ConfigError};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "pixelq.toml",
    "config.toml",
    "./config/pixelq.toml",
    "/etc/pixelq/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then validate it.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, |key| env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("PIXELQ_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS.iter().map(PathBuf::from).find(|p| p.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `PIXELQ_*` overrides read through `lookup`. Unparseable numbers
/// are ignored.
pub(crate) fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Queue
    if let Some(val) = lookup("PIXELQ_QUEUE_PREFIX") {
        config.queue.prefix = val;
    }
    if let Some(val) = lookup("PIXELQ_ENV") {
        config.queue.environment = val;
    }
    if let Some(val) = lookup("PIXELQ_QUEUE_NAME") {
        config.queue.name = val;
    }
    if let Some(val) = lookup("PIXELQ_WORKER_CONCURRENCY") {
        if let Ok(concurrency) = val.parse() {
            config.queue.concurrency = concurrency;
        }
    }
    if let Some(val) = lookup("PIXELQ_POLL_INTERVAL_MS") {
        if let Ok(interval) = val.parse() {
            config.queue.poll_interval_ms = interval;
        }
    }
    if let Some(val) = lookup("PIXELQ_STALLED_INTERVAL_MS") {
        if let Ok(interval) = val.parse() {
            config.queue.stalled_interval_ms = interval;
        }
    }
    if let Some(val) = lookup("PIXELQ_MAX_STALLED_COUNT") {
        if let Ok(count) = val.parse() {
            config.queue.max_stalled_count = count;
        }
    }

    // Orchestrator
    if let Some(val) = lookup("PIXELQ_MAX_RETRIES") {
        if let Ok(retries) = val.parse() {
            config.orchestrator.max_retries = retries;
        }
    }
    if let Some(val) = lookup("PIXELQ_RETRY_DELAY_MS") {
        if let Ok(delay) = val.parse() {
            config.orchestrator.retry_delay_ms = delay;
        }
    }
    if let Some(val) = lookup("PIXELQ_FAILOVER_DELAY_MS") {
        if let Ok(delay) = val.parse() {
            config.orchestrator.failover_delay_ms = delay;
        }
    }
    if let Some(val) = lookup("PIXELQ_SELECTION_STRATEGY") {
        config.orchestrator.strategy = val;
    }
    if let Some(val) = lookup("PIXELQ_DEFAULT_MODEL") {
        config.orchestrator.default_model = Some(val);
    }

    // Moderation
    if let Some(val) = lookup("PIXELQ_MODERATION_ENABLED") {
        config.moderation.enabled = val.parse().unwrap_or(true);
    }

    // Redis
    if let Some(val) = lookup("PIXELQ_REDIS_ENABLED") {
        config.redis.enabled = val.parse().unwrap_or(false);
    }
    if let Some(val) = lookup("PIXELQ_REDIS_URL") {
        config.redis.url = val;
    }
}
