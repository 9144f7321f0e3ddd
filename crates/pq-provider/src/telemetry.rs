//! Prometheus metrics for provider dispatch
//!
//! - Provider attempts by outcome and failovers
//! - Generation latency and cost
//! - Usage gauges and near-limit warnings
//! - Moderation rejections
//! - Circuit state per provider

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::circuit::CircuitState;

pub fn record_provider_attempt(provider: &str, outcome: &str) {
    counter!(
        "pq_provider_attempts_total",
        "provider" => provider.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a provider being given up on in favour of the next one
pub fn record_provider_exhausted(provider: &str, reason: &str) {
    counter!(
        "pq_provider_exhausted_total",
        "provider" => provider.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_generation_duration(provider: &str, duration: Duration) {
    histogram!("pq_generation_duration_seconds", "provider" => provider.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_generation_cost(provider: &str, cost: f64) {
    histogram!("pq_generation_cost", "provider" => provider.to_string()).record(cost);
}

pub fn set_provider_usage(provider: &str, window: &str, usage: u64) {
    gauge!(
        "pq_provider_usage",
        "provider" => provider.to_string(),
        "window" => window.to_string()
    )
    .set(usage as f64);
}

/// Record a provider crossing 90% of its daily allowance
pub fn record_rate_limit_warning(provider: &str) {
    counter!("pq_provider_near_limit_total", "provider" => provider.to_string()).increment(1);
}

pub fn record_moderation_rejection() {
    counter!("pq_moderation_rejections_total").increment(1);
}

/// 0 closed, 1 half-open, 2 open
pub fn set_circuit_state(provider: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("pq_provider_circuit_state", "provider" => provider.to_string()).set(value);
}
