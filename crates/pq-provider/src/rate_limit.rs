//! Per-provider usage counters for daily and per-minute allowances.
//!
//! Counters live in a `KeyValueStore` under window-stamped keys
//! (`YYYY-MM-DD` for the UTC day, `YYYY-MM-DDTHH:MM` for the UTC minute),
//! each expiring at the end of its window. The tracker only observes usage;
//! callers decide what to do with an at-limit status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pq_queue::{KeyValueStore, QueueError};
use serde::Serialize;
use tracing::{debug, warn};

use crate::telemetry;

const SECONDS_PER_DAY: i64 = 86_400;
const SECONDS_PER_MINUTE: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimits {
    pub daily: Option<u64>,
    pub per_minute: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub provider: String,
    pub daily_usage: u64,
    pub minute_usage: u64,
    pub daily_limit: Option<u64>,
    pub minute_limit: Option<u64>,
    /// Daily usage at or above 90% of the daily limit
    pub is_near_limit: bool,
    /// Either window has reached its limit
    pub is_at_limit: bool,
    /// Set only on the increment that moved daily usage past the 90% mark
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub crossed_near_limit: bool,
}

pub struct RateLimitTracker {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    limits: RwLock<HashMap<String, RateLimits>>,
}

impl RateLimitTracker {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            prefix: "pixelq".to_string(),
            limits: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn set_limits(&self, provider: &str, limits: RateLimits) {
        self.limits.write().insert(provider.to_string(), limits);
    }

    /// Unknown providers are unlimited.
    pub fn limits_for(&self, provider: &str) -> RateLimits {
        self.limits.read().get(provider).copied().unwrap_or_default()
    }

    pub async fn check_limit(&self, provider: &str) -> Result<RateLimitStatus, QueueError> {
        self.check_limit_at(provider, Utc::now()).await
    }

    /// Usage in the windows containing `at`.
    pub async fn check_limit_at(&self, provider: &str, at: DateTime<Utc>) -> Result<RateLimitStatus, QueueError> {
        let daily = self.store.get(&self.daily_key(provider, at)).await?.unwrap_or(0);
        let minute = self.store.get(&self.minute_key(provider, at)).await?.unwrap_or(0);
        Ok(self.status(provider, daily, minute))
    }

    /// Count one call against both windows.
    pub async fn increment(&self, provider: &str) -> Result<RateLimitStatus, QueueError> {
        self.increment_at(provider, Utc::now()).await
    }

    pub async fn increment_at(&self, provider: &str, at: DateTime<Utc>) -> Result<RateLimitStatus, QueueError> {
        let entries = [
            (self.daily_key(provider, at), until_boundary(at, SECONDS_PER_DAY)),
            (self.minute_key(provider, at), until_boundary(at, SECONDS_PER_MINUTE)),
        ];
        let values = self.store.incr_many(&entries).await?;
        let daily = values.first().copied().unwrap_or(0);
        let minute = values.get(1).copied().unwrap_or(0);

        telemetry::set_provider_usage(provider, "daily", daily);
        telemetry::set_provider_usage(provider, "minute", minute);

        let mut status = self.status(provider, daily, minute);
        if let Some(limit) = status.daily_limit {
            if near_limit(daily, limit) && !near_limit(daily.saturating_sub(1), limit) {
                warn!(provider, daily_usage = daily, daily_limit = limit, "Provider approaching daily limit");
                telemetry::record_rate_limit_warning(provider);
                status.crossed_near_limit = true;
            }
        }
        debug!(provider, daily_usage = daily, minute_usage = minute, "Provider usage recorded");
        Ok(status)
    }

    fn status(&self, provider: &str, daily: u64, minute: u64) -> RateLimitStatus {
        let limits = self.limits_for(provider);
        let is_near_limit = limits.daily.map_or(false, |limit| near_limit(daily, limit));
        let is_at_limit = limits.daily.map_or(false, |limit| daily >= limit)
            || limits.per_minute.map_or(false, |limit| minute >= limit);
        RateLimitStatus {
            provider: provider.to_string(),
            daily_usage: daily,
            minute_usage: minute,
            daily_limit: limits.daily,
            minute_limit: limits.per_minute,
            is_near_limit,
            is_at_limit,
            crossed_near_limit: false,
        }
    }

    fn daily_key(&self, provider: &str, at: DateTime<Utc>) -> String {
        format!("{}:ratelimit:{}:daily:{}", self.prefix, provider, at.format("%Y-%m-%d"))
    }

    fn minute_key(&self, provider: &str, at: DateTime<Utc>) -> String {
        format!("{}:ratelimit:{}:minute:{}", self.prefix, provider, at.format("%Y-%m-%dT%H:%M"))
    }
}

fn near_limit(usage: u64, limit: u64) -> bool {
    limit > 0 && usage.saturating_mul(10) >= limit.saturating_mul(9)
}

/// Time from `at` to the next multiple of `window_secs` since the epoch.
fn until_boundary(at: DateTime<Utc>, window_secs: i64) -> Duration {
    let next = (at.timestamp().div_euclid(window_secs) + 1) * window_secs * 1000;
    let remaining = next - at.timestamp_millis();
    Duration::from_millis(remaining.max(1) as u64)
}
